//! Compiled queries with change tracking and double-buffered result
//! streams.
//!
//! `CompiledQuery` matches entities against a `ComponentMask` and exposes
//! `changed`/`added_or_changed` views driven by a single monotonic
//! write-epoch per component type, rather than per-chunk version counters,
//! since there is no archetype chunk to tag individually.

use fxhash::FxHashSet;

use crate::bitset::{Bitset, ComponentMask};
use crate::component::ComponentTypeId;
use crate::entity::{Entity, EntityIndex};

/// A named join: follows a `ref` field of `source_type` back to every
/// entity targeting the outer entity through it, keeping only targeters
/// whose own presence satisfies `filter`. Resolved per outer entity during
/// iteration and exposed there as `joined.<name>`.
#[derive(Debug, Clone)]
pub struct JoinDef {
    pub name: String,
    pub source_type: ComponentTypeId,
    pub filter: ComponentMask,
}

/// A declared query shape: required/excluded component types, which of
/// those types should be watched for writes, and any named joins to resolve
/// per outer entity during iteration.
#[derive(Debug, Clone, Default)]
pub struct QueryDef {
    pub mask: ComponentMask,
    pub track_writes: Bitset,
    pub joins: Vec<JoinDef>,
}

impl QueryDef {
    pub fn new() -> Self {
        QueryDef::default()
    }

    pub fn with_component(mut self, type_id: ComponentTypeId) -> Self {
        self.mask = self.mask.require(type_id);
        self
    }

    pub fn without_component(mut self, type_id: ComponentTypeId) -> Self {
        self.mask = self.mask.exclude(type_id);
        self
    }

    pub fn track_writes(mut self, type_id: ComponentTypeId) -> Self {
        self.track_writes.set(type_id);
        self
    }

    /// Declares a named join: during iteration, the outer entity exposes
    /// `joined.<name>` as every live `source_type` holder whose `ref` field
    /// points back at it and whose presence satisfies `filter`.
    pub fn join(mut self, name: impl Into<String>, source_type: ComponentTypeId, filter: ComponentMask) -> Self {
        self.joins.push(JoinDef { name: name.into(), source_type, filter });
        self
    }
}

/// The compiled, runtime form of a `QueryDef`: maintains the live membership
/// set incrementally as shape events are flushed.
#[derive(Debug)]
pub struct CompiledQuery {
    def: QueryDef,
    current: FxHashSet<EntityIndex>,
    added_this_frame: FxHashSet<EntityIndex>,
    removed_this_frame: FxHashSet<EntityIndex>,
    changed_this_frame: FxHashSet<EntityIndex>,
    last_seen_epoch: std::collections::HashMap<EntityIndex, u64, fxhash::FxBuildHasher>,
}

impl CompiledQuery {
    pub fn new(def: QueryDef) -> Self {
        CompiledQuery {
            def,
            current: FxHashSet::default(),
            added_this_frame: FxHashSet::default(),
            removed_this_frame: FxHashSet::default(),
            changed_this_frame: FxHashSet::default(),
            last_seen_epoch: Default::default(),
        }
    }

    pub fn def(&self) -> &QueryDef {
        &self.def
    }

    /// The named join declared on this query by `name`, if any.
    pub fn join_def(&self, name: &str) -> Option<&JoinDef> {
        self.def.joins.iter().find(|j| j.name == name)
    }

    /// Whether `type_id` can flip this query's membership or satisfy its
    /// change-tracking set — used by the executor to decide which compiled
    /// queries need re-evaluating for a given shape event.
    pub fn is_triggered_by(&self, type_id: ComponentTypeId) -> bool {
        self.def.mask.trigger_set().get(type_id) || self.def.track_writes.get(type_id)
    }

    pub fn begin_frame(&mut self) {
        self.added_this_frame.clear();
        self.removed_this_frame.clear();
        self.changed_this_frame.clear();
    }

    /// Re-tests one entity's presence bitset against the mask and updates
    /// `current`/`added`/`removed` accordingly. Called once per shape event
    /// touching a triggering component type.
    pub fn refresh_membership(&mut self, index: EntityIndex, presence: &Bitset) {
        let matches = self.def.mask.matches(presence);
        let was_member = self.current.contains(&index);
        if matches && !was_member {
            self.current.insert(index);
            self.added_this_frame.insert(index);
        } else if !matches && was_member {
            self.current.remove(&index);
            self.removed_this_frame.insert(index);
        }
    }

    /// Records a write to `type_id` on `index` at the given monotonic epoch,
    /// marking the entity changed for this frame if the query tracks that
    /// type and the entity is currently a member.
    pub fn note_write(&mut self, index: EntityIndex, type_id: ComponentTypeId, epoch: u64) {
        if !self.def.track_writes.get(type_id) || !self.current.contains(&index) {
            return;
        }
        let prior = self.last_seen_epoch.insert(index, epoch);
        if prior != Some(epoch) {
            self.changed_this_frame.insert(index);
        }
    }

    pub fn current(&self) -> impl Iterator<Item = EntityIndex> + '_ {
        self.current.iter().copied()
    }

    pub fn added(&self) -> impl Iterator<Item = EntityIndex> + '_ {
        self.added_this_frame.iter().copied()
    }

    pub fn removed(&self) -> impl Iterator<Item = EntityIndex> + '_ {
        self.removed_this_frame.iter().copied()
    }

    pub fn changed(&self) -> impl Iterator<Item = EntityIndex> + '_ {
        self.changed_this_frame.iter().copied()
    }

    pub fn added_or_changed(&self) -> impl Iterator<Item = EntityIndex> + '_ {
        self.added_this_frame.union(&self.changed_this_frame).copied()
    }

    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    pub fn contains(&self, index: EntityIndex) -> bool {
        self.current.contains(&index)
    }
}

pub type QueryId = usize;

/// Owns every compiled query in a world, indexed densely so the executor can
/// cheaply fan a shape event out to only the queries it can affect.
#[derive(Debug, Default)]
pub struct QueryEngine {
    queries: Vec<CompiledQuery>,
}

impl QueryEngine {
    pub fn new() -> Self {
        QueryEngine::default()
    }

    pub fn register(&mut self, def: QueryDef) -> QueryId {
        self.queries.push(CompiledQuery::new(def));
        self.queries.len() - 1
    }

    pub fn get(&self, id: QueryId) -> &CompiledQuery {
        &self.queries[id]
    }

    /// The named join declared on query `id` by `name`, if any.
    pub fn join_def(&self, id: QueryId, name: &str) -> Option<&JoinDef> {
        self.queries[id].join_def(name)
    }

    pub fn begin_frame(&mut self) {
        for q in &mut self.queries {
            q.begin_frame();
        }
    }

    pub fn on_shape_event(&mut self, type_id: ComponentTypeId, index: EntityIndex, presence: &Bitset) {
        for q in &mut self.queries {
            if q.is_triggered_by(type_id) {
                q.refresh_membership(index, presence);
            }
        }
    }

    pub fn on_write(&mut self, type_id: ComponentTypeId, index: EntityIndex, epoch: u64) {
        for q in &mut self.queries {
            q.note_write(index, type_id, epoch);
        }
    }

    /// Entities that are present under `left`'s membership and also present
    /// under `right`'s, a join primitive the executor uses for cross-query
    /// relational filters.
    pub fn join(&self, left: QueryId, right: QueryId) -> Vec<EntityIndex> {
        let r = &self.queries[right];
        self.queries[left]
            .current()
            .filter(|i| r.contains(*i))
            .collect()
    }
}

pub fn as_entity(index: EntityIndex, generation_of: impl Fn(EntityIndex) -> u32) -> Entity {
    Entity::new(index, generation_of(index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_tracks_add_and_remove() {
        let def = QueryDef::new().with_component(0).without_component(1);
        let mut q = CompiledQuery::new(def);
        let mut presence = Bitset::new();
        presence.set(0);

        q.begin_frame();
        q.refresh_membership(5, &presence);
        assert!(q.current().any(|i| i == 5));
        assert!(q.added().any(|i| i == 5));

        q.begin_frame();
        presence.set(1);
        q.refresh_membership(5, &presence);
        assert!(!q.current().any(|i| i == 5));
        assert!(q.removed().any(|i| i == 5));
    }

    #[test]
    fn write_tracking_only_fires_for_current_members() {
        let def = QueryDef::new().with_component(0).track_writes(0);
        let mut q = CompiledQuery::new(def);
        q.note_write(1, 0, 7);
        assert!(!q.changed().any(|i| i == 1));

        let mut presence = Bitset::new();
        presence.set(0);
        q.begin_frame();
        q.refresh_membership(1, &presence);
        q.note_write(1, 0, 7);
        assert!(q.changed().any(|i| i == 1));
    }

    #[test]
    fn named_join_is_resolvable_by_name() {
        let def = QueryDef::new()
            .with_component(0)
            .join("targeters", 1, ComponentMask::default().require(2));
        let q = CompiledQuery::new(def);
        let j = q.join_def("targeters").unwrap();
        assert_eq!(j.source_type, 1);
        assert!(q.join_def("missing").is_none());
    }

    #[test]
    fn join_intersects_two_queries() {
        let mut engine = QueryEngine::new();
        let a = engine.register(QueryDef::new().with_component(0));
        let b = engine.register(QueryDef::new().with_component(1));
        let mut p1 = Bitset::new();
        p1.set(0);
        let mut p2 = Bitset::new();
        p2.set(1);
        let mut both = Bitset::new();
        both.set(0);
        both.set(1);

        engine.on_shape_event(0, 1, &p1);
        engine.on_shape_event(1, 2, &p2);
        engine.on_shape_event(0, 3, &both);
        engine.on_shape_event(1, 3, &both);

        let joined = engine.join(a, b);
        assert_eq!(joined, vec![3]);
    }
}
