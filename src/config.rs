//! World construction options.
//!
//! `WorldConfig` collects every bound and tunable fixed at `World::create`
//! time into one struct, deriving `Default` for sensible zero-ish defaults
//! and gating `serde::Serialize`/`Deserialize` behind the `serialize`
//! feature.

#[cfg(feature = "serialize")]
use serde::{Deserialize, Serialize};

/// Bounds and tunables fixed at `World::create` time and never changed
/// afterward.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub struct WorldConfig {
    /// Maximum number of simultaneously live entities.
    pub max_entities: u32,
    /// Entity indices freed by `delete` are held here before being recycled.
    pub max_limbo_entities: usize,
    /// Component rows freed by `remove`/`delete` are held here before being
    /// compacted out of their store.
    pub max_limbo_components: usize,
    /// Frames an entity index or component row spends in limbo before it is
    /// eligible for recycling.
    pub limbo_frames: u64,
    /// Upper bound on shape-change (add/remove/delete) events recorded in a
    /// single frame.
    pub max_shape_changes_per_frame: usize,
    /// Upper bound on ref-link/unlink events recorded in a single frame.
    pub max_ref_changes_per_frame: usize,
    /// Frames a severed back-reference stays visible to a stale-capable,
    /// `includeStale` back-refs read.
    pub ref_stale_frames: u64,
    /// Number of parallel execution lanes; 1 disables the `rayon` thread
    /// pool entirely and runs every lane inline.
    pub threads: usize,
    /// Wall-clock seconds attributed to one `execute()` call, used to drive
    /// coroutine `AfterSeconds` countdowns.
    pub frame_seconds: f64,
}

impl Default for WorldConfig {
    fn default() -> Self {
        WorldConfig {
            max_entities: 1 << 16,
            max_limbo_entities: 4096,
            max_limbo_components: 4096,
            limbo_frames: 1,
            max_shape_changes_per_frame: 4096,
            max_ref_changes_per_frame: 4096,
            ref_stale_frames: 1,
            threads: 1,
            frame_seconds: 1.0 / 60.0,
        }
    }
}

impl WorldConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_entities == 0 {
            return Err("max_entities must be greater than zero".into());
        }
        if self.threads == 0 {
            return Err("threads must be at least 1".into());
        }
        if self.frame_seconds <= 0.0 {
            return Err("frame_seconds must be greater than zero".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(WorldConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_entities_is_rejected() {
        let cfg = WorldConfig {
            max_entities: 0,
            ..WorldConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
