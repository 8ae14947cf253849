//! Entity identity, component-presence bitsets, shape-change journal, and
//! limbo.
//!
//! `Registry` is the single owner of both identity (generational recycling
//! through `EntityIndex`/`Generation`) and presence (one `Bitset` per
//! entity). Deletions and removals are staged through the shape journal and
//! a limbo pool rather than freed immediately, so a stale-capable handle can
//! still observe a row for a configured number of frames after it is gone.

use fxhash::FxHashMap;
use smallvec::SmallVec;

use crate::bitset::Bitset;
use crate::component::ComponentTypeId;
use crate::entity::{Entity, EntityIndex, Generation};
use crate::error::{WorldError, WorldResult};
use crate::pool::IndexPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeOp {
    Add,
    Remove,
    Delete,
}

#[derive(Debug, Clone, Copy)]
pub struct ShapeEvent {
    pub entity: Entity,
    pub component_type: ComponentTypeId,
    pub op: ShapeOp,
    pub frame: u64,
}

/// The append-only ring described in "Shape Journal". Bounded by
/// `max_shape_changes_per_frame`; pushing past capacity is a `Capacity`
/// error rather than silently dropping events, since a
/// dropped shape event would desynchronize query membership.
#[derive(Debug, Default)]
pub struct ShapeJournal {
    events: Vec<ShapeEvent>,
    capacity: usize,
}

impl ShapeJournal {
    pub fn new(capacity: usize) -> Self {
        ShapeJournal {
            events: Vec::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    pub fn push(&mut self, event: ShapeEvent) -> WorldResult<()> {
        if self.events.len() >= self.capacity {
            return Err(WorldError::ShapeJournalCapacityExceeded { limit: self.capacity });
        }
        self.events.push(event);
        Ok(())
    }

    pub fn drain(&mut self) -> Vec<ShapeEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn events(&self) -> &[ShapeEvent] {
        &self.events
    }
}

/// A host-registered predicate over a presence bitset, used by `validate`
/// Expressed as `Fn(&Bitset) -> bool` per the
/// phrasing ("invariants are expressed as predicates over the presence
/// bitset").
pub type Validator = Box<dyn Fn(&Bitset) -> bool + Send + Sync>;

struct ValidatorEntry {
    name: &'static str,
    check: Validator,
}

#[derive(Debug, Clone, Copy)]
struct LimboEntity {
    index: EntityIndex,
    freed_on_frame: u64,
}

/// Owns entity identity, per-entity presence bitsets, the shape journal, and
/// the limbo pools for both entity indices and (transitively, through each
/// `ComponentStore`) component rows.
pub struct Registry {
    index_pool: IndexPool,
    generations: Vec<Generation>,
    presence: Vec<Bitset>,
    journal: ShapeJournal,
    limbo_entities: Vec<LimboEntity>,
    max_limbo_entities: usize,
    limbo_frames: u64,
    validators: FxHashMap<ComponentTypeId, SmallVec<[ValidatorEntry; 2]>>,
    current_frame: u64,
}

impl Registry {
    pub fn new(max_entities: u32, max_shape_changes_per_frame: usize, max_limbo_entities: usize, limbo_frames: u64) -> Self {
        Registry {
            index_pool: IndexPool::new(max_entities),
            generations: vec![0; max_entities as usize],
            presence: vec![Bitset::new(); max_entities as usize],
            journal: ShapeJournal::new(max_shape_changes_per_frame),
            limbo_entities: Vec::new(),
            max_limbo_entities,
            limbo_frames,
            validators: FxHashMap::default(),
            current_frame: 0,
        }
    }

    pub fn current_frame(&self) -> u64 {
        self.current_frame
    }

    pub fn set_current_frame(&mut self, frame: u64) {
        self.current_frame = frame;
    }

    pub fn register_validator(&mut self, type_id: ComponentTypeId, name: &'static str, check: Validator) {
        self.validators
            .entry(type_id)
            .or_default()
            .push(ValidatorEntry { name, check });
    }

    /// Draws a fresh index, sets its generation odd (alive), and returns the
    /// live handle. Fails with `EntityCapacityExceeded` when the index pool
    /// is exhausted.
    pub fn create(&mut self) -> WorldResult<Entity> {
        let index = self
            .index_pool
            .take()
            .ok_or_else(|| WorldError::EntityCapacityExceeded {
                limit: self.index_pool.capacity() as usize,
            })?;
        let generation = self.generations[index as usize].wrapping_add(1) | 1;
        self.generations[index as usize] = generation;
        self.presence[index as usize] = Bitset::new();
        Ok(Entity::new(index, generation))
    }

    /// Whether `index` is currently parked in the limbo pool (deleted but
    /// not yet recycled), the window during which a stale-capable ref read
    /// may still observe it.
    pub fn is_in_limbo(&self, index: EntityIndex) -> bool {
        self.limbo_entities.iter().any(|l| l.index == index)
    }

    pub fn is_alive(&self, entity: &Entity) -> bool {
        (entity.index() as usize) < self.generations.len()
            && self.generations[entity.index() as usize] == entity.generation()
            && entity.is_alive_generation()
    }

    pub fn presence(&self, index: EntityIndex) -> &Bitset {
        &self.presence[index as usize]
    }

    /// Sets the presence bit and appends a shape event, unless it exactly
    /// cancels a pending same-frame `remove`.
    pub fn add(&mut self, entity: Entity, type_id: ComponentTypeId) -> WorldResult<()> {
        let cancels_pending_remove = self.journal.events.iter().rposition(|e| {
            e.entity.is_same(&entity) && e.component_type == type_id && e.frame == self.current_frame
        });

        if let Some(pos) = cancels_pending_remove {
            if self.journal.events[pos].op == ShapeOp::Remove {
                self.journal.events.remove(pos);
                self.presence[entity.index() as usize].set(type_id);
                return Ok(());
            }
        }

        self.presence[entity.index() as usize].set(type_id);
        self.journal.push(ShapeEvent {
            entity,
            component_type: type_id,
            op: ShapeOp::Add,
            frame: self.current_frame,
        })
    }

    pub fn remove(&mut self, entity: Entity, type_id: ComponentTypeId) -> WorldResult<()> {
        self.presence[entity.index() as usize].clear_bit(type_id);
        self.journal.push(ShapeEvent {
            entity,
            component_type: type_id,
            op: ShapeOp::Remove,
            frame: self.current_frame,
        })
    }

    /// Clears presence, journals a `Delete` event per previously-present
    /// component type, and parks the index in the limbo pool instead of
    /// recycling it immediately.
    pub fn delete(&mut self, entity: Entity) -> WorldResult<Vec<ComponentTypeId>> {
        let index = entity.index();
        let present: Vec<ComponentTypeId> = self.presence[index as usize].iter().collect();

        for &type_id in &present {
            self.journal.push(ShapeEvent {
                entity,
                component_type: type_id,
                op: ShapeOp::Delete,
                frame: self.current_frame,
            })?;
        }

        self.presence[index as usize] = Bitset::new();
        self.generations[index as usize] = self.generations[index as usize].wrapping_add(1) & !1;

        if self.limbo_entities.len() >= self.max_limbo_entities {
            return Err(WorldError::LimboEntityCapacityExceeded {
                limit: self.max_limbo_entities,
            });
        }
        self.limbo_entities.push(LimboEntity {
            index,
            freed_on_frame: self.current_frame,
        });

        Ok(present)
    }

    /// Returns indices whose limbo window has elapsed to the entity pool,
    /// retiring their generation to the next odd value when reused.
    pub fn advance_limbo(&mut self) {
        let frame = self.current_frame;
        let limbo_frames = self.limbo_frames;
        let mut retained = Vec::with_capacity(self.limbo_entities.len());
        for entry in self.limbo_entities.drain(..) {
            if frame.saturating_sub(entry.freed_on_frame) >= limbo_frames {
                self.index_pool.return_id(entry.index);
            } else {
                retained.push(entry);
            }
        }
        self.limbo_entities = retained;
    }

    pub fn validate(&self, entity: Entity, type_id: ComponentTypeId) -> WorldResult<()> {
        if let Some(validators) = self.validators.get(&type_id) {
            let presence = &self.presence[entity.index() as usize];
            for v in validators {
                if !(v.check)(presence) {
                    return Err(WorldError::InvalidShape {
                        entity,
                        type_name: v.name,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn drain_journal(&mut self) -> Vec<ShapeEvent> {
        self.journal.drain()
    }

    pub fn journal(&self) -> &ShapeJournal {
        &self.journal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        Registry::new(8, 64, 8, 1)
    }

    #[test]
    fn create_then_delete_never_reissues_identity() {
        let mut reg = registry();
        let e = reg.create().unwrap();
        reg.delete(e).unwrap();
        reg.advance_limbo();
        reg.set_current_frame(1);
        reg.advance_limbo();
        let e2 = reg.create().unwrap();
        assert_ne!(e, e2);
    }

    #[test]
    fn add_cancels_pending_remove_same_frame() {
        let mut reg = registry();
        let e = reg.create().unwrap();
        reg.add(e, 0).unwrap();
        reg.remove(e, 0).unwrap();
        reg.add(e, 0).unwrap();
        assert_eq!(reg.journal().events().len(), 1);
        assert!(reg.presence(e.index()).get(0));
    }

    #[test]
    fn capacity_exceeded_reports_limit() {
        let mut reg = Registry::new(1, 64, 8, 1);
        reg.create().unwrap();
        let err = reg.create().unwrap_err();
        assert!(matches!(err, WorldError::EntityCapacityExceeded { limit: 1 }));
    }
}
