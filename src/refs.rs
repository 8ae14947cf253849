//! Forward/back-reference indexing over `Ref` fields.
//!
//! Maintains the inverse of every live `Ref` field: given a target entity,
//! which entities hold a reference to it. Back-reference buckets are empty
//! or singleton in the overwhelmingly common case and only rarely fan out to
//! many referrers, so `Bucket` grows from `Empty` through `Single`/`Array`
//! into an indexed form only once a referrer count crosses `PROMOTE_AT`.

use fxhash::FxHashMap;
use smallvec::SmallVec;

use crate::component::ComponentTypeId;
use crate::entity::{Entity, EntityIndex};
use crate::error::{WorldError, WorldResult};

/// One recorded reference: `source` holds a `Ref` field named `field` on
/// component type `source_type`, pointing at some target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefEntry {
    pub source: Entity,
    pub source_type: ComponentTypeId,
    pub field: usize,
}

/// A cardinality-adaptive set of referrers. `Single` and a small inline
/// `Array` avoid heap allocation for the overwhelmingly common 0-or-1-referrer
/// case; `Indexed` is promoted to once a bucket grows past the inline
/// capacity, so a hub entity referenced by thousands of sources doesn't pay a
/// linear scan on every insert/remove.
#[derive(Debug, Clone)]
enum Bucket {
    Empty,
    Single(RefEntry),
    Array(SmallVec<[RefEntry; 4]>),
    Indexed(FxHashMap<(EntityIndex, ComponentTypeId, usize), RefEntry>),
}

impl Default for Bucket {
    fn default() -> Self {
        Bucket::Empty
    }
}

const PROMOTE_AT: usize = 16;

fn key(entry: &RefEntry) -> (EntityIndex, ComponentTypeId, usize) {
    (entry.source.index(), entry.source_type, entry.field)
}

impl Bucket {
    fn insert(&mut self, entry: RefEntry) {
        match self {
            Bucket::Empty => *self = Bucket::Single(entry),
            Bucket::Single(existing) => {
                let mut arr = SmallVec::new();
                arr.push(*existing);
                arr.push(entry);
                *self = Bucket::Array(arr);
            }
            Bucket::Array(arr) => {
                if arr.iter().any(|e| key(e) == key(&entry)) {
                    return;
                }
                if arr.len() + 1 > PROMOTE_AT {
                    let mut map: FxHashMap<_, _> =
                        arr.drain(..).map(|e| (key(&e), e)).collect();
                    map.insert(key(&entry), entry);
                    *self = Bucket::Indexed(map);
                } else {
                    arr.push(entry);
                }
            }
            Bucket::Indexed(map) => {
                map.insert(key(&entry), entry);
            }
        }
    }

    fn remove(&mut self, k: (EntityIndex, ComponentTypeId, usize)) {
        match self {
            Bucket::Empty => {}
            Bucket::Single(existing) => {
                if key(existing) == k {
                    *self = Bucket::Empty;
                }
            }
            Bucket::Array(arr) => {
                arr.retain(|e| key(e) != k);
                if arr.is_empty() {
                    *self = Bucket::Empty;
                }
            }
            Bucket::Indexed(map) => {
                map.remove(&k);
            }
        }
    }

    fn iter(&self) -> Box<dyn Iterator<Item = &RefEntry> + '_> {
        match self {
            Bucket::Empty => Box::new(std::iter::empty()),
            Bucket::Single(e) => Box::new(std::iter::once(e)),
            Bucket::Array(arr) => Box::new(arr.iter()),
            Bucket::Indexed(map) => Box::new(map.values()),
        }
    }

    fn is_empty(&self) -> bool {
        matches!(self, Bucket::Empty)
    }
}

#[derive(Debug, Clone, Copy)]
struct Stashed {
    entry: RefEntry,
    removed_on_frame: u64,
}

/// Maintains the inverse of every `Ref` field: given a target entity, find
/// everything pointing at it, either precisely (exact source type + field),
/// by source type, or globally. Also retains a bounded window of
/// recently-removed references (`global_with_stale`) so a back-refs field
/// with `includeStale: true` can still see referrers whose link was severed
/// in the same frame the target was deleted.
#[derive(Debug, Default)]
pub struct RefIndex {
    precise: FxHashMap<(EntityIndex, ComponentTypeId, usize), Bucket>,
    by_type: FxHashMap<(EntityIndex, ComponentTypeId), Bucket>,
    global: FxHashMap<EntityIndex, Bucket>,
    stale: FxHashMap<EntityIndex, Vec<Stashed>>,
    max_ref_changes_per_frame: usize,
    changes_this_frame: usize,
}

impl RefIndex {
    pub fn new(max_ref_changes_per_frame: usize) -> Self {
        RefIndex {
            precise: FxHashMap::default(),
            by_type: FxHashMap::default(),
            global: FxHashMap::default(),
            stale: FxHashMap::default(),
            max_ref_changes_per_frame,
            changes_this_frame: 0,
        }
    }

    pub fn begin_frame(&mut self) {
        self.changes_this_frame = 0;
    }

    fn charge(&mut self) -> WorldResult<()> {
        if self.changes_this_frame >= self.max_ref_changes_per_frame {
            return Err(WorldError::RefJournalCapacityExceeded {
                limit: self.max_ref_changes_per_frame,
            });
        }
        self.changes_this_frame += 1;
        Ok(())
    }

    pub fn link(&mut self, target: Entity, entry: RefEntry) -> WorldResult<()> {
        self.charge()?;
        self.precise
            .entry((target.index(), entry.source_type, entry.field))
            .or_default()
            .insert(entry);
        self.by_type
            .entry((target.index(), entry.source_type))
            .or_default()
            .insert(entry);
        self.global.entry(target.index()).or_default().insert(entry);
        Ok(())
    }

    pub fn unlink(&mut self, target: Entity, entry: RefEntry, frame: u64) -> WorldResult<()> {
        self.charge()?;
        let k = key(&entry);
        if let Some(b) = self.precise.get_mut(&(target.index(), entry.source_type, entry.field)) {
            b.remove(k);
        }
        if let Some(b) = self.by_type.get_mut(&(target.index(), entry.source_type)) {
            b.remove(k);
        }
        if let Some(b) = self.global.get_mut(&target.index()) {
            b.remove(k);
        }
        self.stale
            .entry(target.index())
            .or_default()
            .push(Stashed { entry, removed_on_frame: frame });
        Ok(())
    }

    /// Clears stale entries older than `stale_frames` relative to `now`.
    pub fn advance_limbo(&mut self, now: u64, stale_frames: u64) {
        self.stale.retain(|_, entries| {
            entries.retain(|s| now.saturating_sub(s.removed_on_frame) < stale_frames);
            !entries.is_empty()
        });
    }

    pub fn precise_refs(&self, target: Entity, source_type: ComponentTypeId, field: usize) -> Vec<RefEntry> {
        self.precise
            .get(&(target.index(), source_type, field))
            .map(|b| b.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn refs_by_type(&self, target: Entity, source_type: ComponentTypeId) -> Vec<RefEntry> {
        self.by_type
            .get(&(target.index(), source_type))
            .map(|b| b.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn all_refs(&self, target: Entity, include_stale: bool) -> Vec<RefEntry> {
        let mut out: Vec<RefEntry> = self
            .global
            .get(&target.index())
            .map(|b| b.iter().copied().collect())
            .unwrap_or_default();
        if include_stale {
            if let Some(stashed) = self.stale.get(&target.index()) {
                out.extend(stashed.iter().map(|s| s.entry));
            }
        }
        out
    }

    pub fn has_any_referrer(&self, target: Entity) -> bool {
        self.global.get(&target.index()).map(|b| !b.is_empty()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;

    fn e(i: u32) -> Entity {
        Entity::new(i, 1)
    }

    #[test]
    fn link_then_unlink_roundtrip() {
        let mut idx = RefIndex::new(64);
        let target = e(1);
        let entry = RefEntry { source: e(2), source_type: 0, field: 0 };
        idx.link(target, entry).unwrap();
        assert_eq!(idx.precise_refs(target, 0, 0), vec![entry]);
        assert!(idx.has_any_referrer(target));

        idx.unlink(target, entry, 5).unwrap();
        assert!(idx.precise_refs(target, 0, 0).is_empty());
        assert!(!idx.has_any_referrer(target));
        assert_eq!(idx.all_refs(target, true), vec![entry]);
    }

    #[test]
    fn stale_entries_expire_after_window() {
        let mut idx = RefIndex::new(64);
        let target = e(1);
        let entry = RefEntry { source: e(2), source_type: 0, field: 0 };
        idx.link(target, entry).unwrap();
        idx.unlink(target, entry, 0).unwrap();
        idx.advance_limbo(0, 2);
        assert_eq!(idx.all_refs(target, true).len(), 1);
        idx.advance_limbo(2, 2);
        assert!(idx.all_refs(target, true).is_empty());
    }

    #[test]
    fn bucket_promotes_past_inline_capacity() {
        let mut idx = RefIndex::new(1024);
        let target = e(9);
        for i in 0..32u32 {
            idx.link(target, RefEntry { source: e(i), source_type: 0, field: 0 }).unwrap();
        }
        assert_eq!(idx.all_refs(target, false).len(), 32);
    }

    #[test]
    fn ref_journal_capacity_enforced() {
        let mut idx = RefIndex::new(1);
        idx.link(e(1), RefEntry { source: e(2), source_type: 0, field: 0 }).unwrap();
        let err = idx.link(e(1), RefEntry { source: e(3), source_type: 0, field: 0 }).unwrap_err();
        assert!(matches!(err, WorldError::RefJournalCapacityExceeded { limit: 1 }));
    }
}
