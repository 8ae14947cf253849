//! The world: lifecycle, entity-handle operations, and the per-frame
//! execution loop.
//!
//! `World::create` builds the registry, stores, and planner from a declared
//! component schema; `add`/`remove`/`delete`/`read`/`write` are the direct
//! entity-handle surface; `execute` flushes the shape journal, advances
//! every limbo window, runs the planned schedule, and steps coroutines once
//! per frame.

use fxhash::FxHashMap;

use crate::bitset::ComponentMask;
use crate::component::{ComponentType, ComponentTypeDef, ComponentTypeId};
use crate::config::WorldConfig;
use crate::coroutine::{CancelTrigger, CoroutineId, CoroutineScheduler, CoroutineScope, GuardFn, StepFn};
use crate::entity::Entity;
use crate::error::{WorldError, WorldResult};
use crate::graph::Graph;
use crate::planner::{Planner, PlannedSystem};
use crate::query::{QueryDef, QueryEngine, QueryId};
use crate::refs::{RefEntry, RefIndex};
use crate::registry::{Registry, ShapeOp};
use crate::store::{ComponentStore, FieldAccessor};
use crate::system::System;

/// The single entity index reserved for host-level globals, never recycled
/// (see `DESIGN.md` for the singleton access-pattern decision).
pub const SINGLETON_INDEX: u32 = 0;

struct ScheduledSystem {
    system: Box<dyn System>,
    lane: usize,
}

/// Owns every subsystem of the runtime: entity identity, per-type component
/// storage, the ref index, the query engine, the planned schedule, and the
/// coroutine scheduler. This is the type passed to every system's
/// `execute`/`initialize`/`finalize`.
pub struct World {
    config: WorldConfig,
    registry: Registry,
    component_types: Vec<ComponentType>,
    type_by_name: FxHashMap<String, ComponentTypeId>,
    stores: Vec<ComponentStore>,
    ref_index: RefIndex,
    queries: QueryEngine,
    planner: Planner,
    systems: Vec<ScheduledSystem>,
    schedule: Option<(Graph, Vec<PlannedSystem>)>,
    coroutines: CoroutineScheduler,
    healthy: bool,
    frame_number: u64,
}

impl World {
    /// Builds a world from a component-type schema and config, reserving
    /// entity index 0 as the singleton slot.
    pub fn create(defs: Vec<ComponentTypeDef>, config: WorldConfig) -> WorldResult<Self> {
        config.validate().map_err(WorldError::internal)?;

        let mut component_types = Vec::with_capacity(defs.len());
        let mut type_by_name = FxHashMap::default();
        let mut stores = Vec::with_capacity(defs.len());

        for (id, def) in defs.into_iter().enumerate() {
            if type_by_name.contains_key(&def.name) {
                return Err(WorldError::DuplicateComponentType(def.name));
            }
            let ty = ComponentType {
                id,
                name: def.name.clone(),
                storage: def.storage.unwrap_or(crate::component::StorageFlavor::Sparse),
                fields: def.fields,
            };
            stores.push(ComponentStore::new(&ty, config.max_limbo_components));
            type_by_name.insert(def.name, id);
            component_types.push(ty);
        }

        let mut registry = Registry::new(
            config.max_entities,
            config.max_shape_changes_per_frame,
            config.max_limbo_entities,
            config.limbo_frames,
        );

        let singleton = registry.create()?;
        debug_assert_eq!(singleton.index(), SINGLETON_INDEX);

        Ok(World {
            ref_index: RefIndex::new(config.max_ref_changes_per_frame),
            queries: QueryEngine::new(),
            planner: Planner::new(),
            systems: Vec::new(),
            schedule: None,
            coroutines: CoroutineScheduler::new(),
            healthy: true,
            frame_number: 0,
            registry,
            component_types,
            type_by_name,
            stores,
            config,
        })
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn singleton(&self) -> Entity {
        Entity::new(SINGLETON_INDEX, 1)
    }

    pub fn component_type_id(&self, name: &str) -> Option<ComponentTypeId> {
        self.type_by_name.get(name).copied()
    }

    pub fn component_type(&self, type_id: ComponentTypeId) -> &ComponentType {
        &self.component_types[type_id]
    }

    fn store(&self, type_id: ComponentTypeId) -> &ComponentStore {
        &self.stores[type_id]
    }

    fn store_mut(&mut self, type_id: ComponentTypeId) -> &mut ComponentStore {
        &mut self.stores[type_id]
    }

    // --- System and query registration -----------------------------------

    pub fn register_query(&mut self, def: QueryDef) -> QueryId {
        self.queries.register(def)
    }

    pub fn query(&self, id: QueryId) -> &crate::query::CompiledQuery {
        self.queries.get(id)
    }

    pub fn add_system(&mut self, system: impl System + 'static) {
        self.systems.push(ScheduledSystem { system: Box::new(system), lane: 0 });
        self.schedule = None;
    }

    /// (Re)builds the conflict graph from currently-declared systems and
    /// seals a lane assignment. Called automatically by `execute` the first
    /// time it runs, or explicitly after adding systems mid-lifetime.
    pub fn build_schedule(&mut self) -> WorldResult<()> {
        let mut planner = Planner::new();
        for scheduled in &self.systems {
            planner.declare(crate::planner::SystemDecl {
                name: scheduled.system.name().to_string(),
                access: scheduled.system.access().clone(),
                directives: scheduled.system.directives().to_vec(),
            });
        }
        let (graph, planned) = planner.plan()?;
        for p in &planned {
            self.systems[p.system].lane = p.lane;
        }
        self.planner = planner;
        self.schedule = Some((graph, planned));
        Ok(())
    }

    pub fn spawn_coroutine(&mut self, parent: Option<CoroutineId>, step: StepFn) -> CoroutineId {
        self.coroutines.spawn(parent, step)
    }

    /// Spawns a coroutine scoped to `scope` (cancelled when the scope
    /// entity is deleted, or when its required component is removed) and/or
    /// guarded by `cancel_if`, re-evaluated every frame it is suspended.
    pub fn spawn_scoped_coroutine(
        &mut self,
        parent: Option<CoroutineId>,
        step: StepFn,
        scope: Option<CoroutineScope>,
        cancel_if: Option<GuardFn>,
    ) -> CoroutineId {
        self.coroutines.spawn_scoped(parent, step, scope, cancel_if)
    }

    pub fn cancel_coroutine(&mut self, id: CoroutineId, trigger: CancelTrigger) {
        self.coroutines.cancel(id, trigger);
    }

    pub fn coroutine_state(&self, id: CoroutineId) -> Option<crate::coroutine::CoroutineState> {
        self.coroutines.state(id)
    }

    /// Installs a shape validator for `type_id`, consulted by `add`/`remove`
    /// right after the presence bitset changes.
    pub fn register_validator(&mut self, type_id: ComponentTypeId, name: &'static str, check: crate::registry::Validator) {
        self.registry.register_validator(type_id, name, check);
    }

    // --- Entity-handle operations --------------------------------------

    pub fn create_entity(&mut self) -> WorldResult<Entity> {
        self.registry.create()
    }

    pub fn is_same(&self, a: Entity, b: Entity) -> bool {
        a.is_same(&b)
    }

    pub fn hold(&self, entity: Entity) -> Entity {
        entity.with_access_recently_deleted_data(true)
    }

    pub fn has(&self, entity: Entity, type_id: ComponentTypeId) -> bool {
        self.registry.presence(entity.index()).get(type_id)
    }

    pub fn has_all_of(&self, entity: Entity, type_ids: &[ComponentTypeId]) -> bool {
        type_ids.iter().all(|&t| self.has(entity, t))
    }

    pub fn has_some_of(&self, entity: Entity, type_ids: &[ComponentTypeId]) -> bool {
        type_ids.iter().any(|&t| self.has(entity, t))
    }

    pub fn has_any_other_than(&self, entity: Entity, type_ids: &[ComponentTypeId]) -> bool {
        self.registry
            .presence(entity.index())
            .iter()
            .any(|t| !type_ids.contains(&t))
    }

    pub fn count_has(&self, entity: Entity, type_ids: &[ComponentTypeId]) -> usize {
        type_ids.iter().filter(|&&t| self.has(entity, t)).count()
    }

    pub fn add(&mut self, entity: Entity, type_id: ComponentTypeId) -> WorldResult<()> {
        self.registry.add(entity, type_id)?;
        self.store_mut(type_id).add(entity.index());
        let presence = self.registry.presence(entity.index()).clone();
        self.queries.on_shape_event(type_id, entity.index(), &presence);
        self.registry.validate(entity, type_id)?;
        Ok(())
    }

    pub fn remove(&mut self, entity: Entity, type_id: ComponentTypeId) -> WorldResult<()> {
        self.registry.remove(entity, type_id)?;
        let frame_number = self.frame_number;
        self.store_mut(type_id).remove(entity.index(), frame_number)?;
        let presence = self.registry.presence(entity.index()).clone();
        self.queries.on_shape_event(type_id, entity.index(), &presence);
        self.coroutines.cancel_scope_component(entity.index(), type_id);
        self.registry.validate(entity, type_id)?;
        Ok(())
    }

    /// Clears every declared component type and journals the entity's
    /// deletion, leaving its index parked in limbo.
    pub fn delete(&mut self, entity: Entity) -> WorldResult<()> {
        let removed_types = self.registry.delete(entity)?;
        let frame_number = self.frame_number;
        for type_id in removed_types {
            self.store_mut(type_id).remove(entity.index(), frame_number)?;
            let presence = self.registry.presence(entity.index()).clone();
            self.queries.on_shape_event(type_id, entity.index(), &presence);
        }
        self.coroutines.cancel_scope_entity(entity.index());
        Ok(())
    }

    pub fn read(&self, entity: Entity, type_id: ComponentTypeId) -> WorldResult<FieldAccessor<'_>> {
        self.store(type_id).access(entity, false)
    }

    pub fn write(&mut self, entity: Entity, type_id: ComponentTypeId) -> WorldResult<FieldAccessor<'_>> {
        self.store(type_id).access(entity, true)
    }

    /// Records a write-epoch bump against every tracking query, for use
    /// right after a `write()` accessor performs its mutation (see `query.rs`
    /// "change tracking").
    pub fn note_write(&mut self, entity: Entity, type_id: ComponentTypeId, epoch: u64) {
        self.queries.on_write(type_id, entity.index(), epoch);
    }

    // --- Ref index plumbing -------------------------------------------

    pub fn link_ref(&mut self, target: Entity, entry: RefEntry) -> WorldResult<()> {
        self.ref_index.link(target, entry)
    }

    pub fn unlink_ref(&mut self, target: Entity, entry: RefEntry) -> WorldResult<()> {
        self.ref_index.unlink(target, entry, self.frame_number)
    }

    pub fn back_refs(&self, target: Entity, include_stale: bool) -> Vec<RefEntry> {
        self.ref_index.all_refs(target, include_stale)
    }

    /// Resolves a named join declared on `query` for the outer entity
    /// `target`: every live entity holding a `ref` field of the join's
    /// `source_type` pointing at `target`, whose own presence satisfies the
    /// join's filter. This is what `joined.<name>` resolves to during
    /// iteration over `query`.
    pub fn joined(&self, query: QueryId, target: Entity, name: &str) -> WorldResult<Vec<Entity>> {
        let join = self
            .queries
            .join_def(query, name)
            .ok_or_else(|| WorldError::internal(format!("no join named {:?} declared on this query", name)))?;
        Ok(self.joined_refs(target, join.source_type, &join.filter))
    }

    /// The underlying join primitive `joined` resolves through: every live
    /// entity holding a `ref` field of `source_type` pointing at `target`,
    /// whose own presence satisfies `filter`.
    pub fn joined_refs(&self, target: Entity, source_type: ComponentTypeId, filter: &ComponentMask) -> Vec<Entity> {
        self.ref_index
            .refs_by_type(target, source_type)
            .into_iter()
            .filter(|r| filter.matches(self.registry.presence(r.source.index())))
            .map(|r| r.source)
            .collect()
    }

    /// Reads a `ref` field, degrading a dangling forward pointer to `None`
    /// unless `entity`'s handle is stale-capable and the dead target is
    /// still within its limbo window.
    pub fn read_ref(&self, entity: Entity, type_id: ComponentTypeId, field: usize) -> WorldResult<Option<Entity>> {
        let acc = self.store(type_id).access(entity, false)?;
        let raw = acc.get_ref(field)?;
        Ok(match raw {
            Some(target) if self.registry.is_alive(&target) => Some(target),
            Some(target) if entity.can_access_recently_deleted_data() && self.registry.is_in_limbo(target.index()) => {
                Some(target)
            }
            _ => None,
        })
    }

    /// Writes a `ref` field and updates the back-reference index with the
    /// delta between the old and new target.
    pub fn write_ref(
        &mut self,
        entity: Entity,
        type_id: ComponentTypeId,
        field: usize,
        new_target: Option<Entity>,
    ) -> WorldResult<()> {
        let old_target = {
            let acc = self.store(type_id).access(entity, false)?;
            acc.get_ref(field)?
        };
        {
            let acc = self.store(type_id).access(entity, true)?;
            acc.set_ref(field, new_target)?;
        }
        if let Some(old) = old_target {
            self.ref_index.unlink(old, RefEntry { source: entity, source_type: type_id, field }, self.frame_number)?;
        }
        if let Some(new) = new_target {
            self.ref_index.link(new, RefEntry { source: entity, source_type: type_id, field })?;
        }
        Ok(())
    }

    /// Runs `f` outside the frame loop, with full access to entity-handle
    /// and component operations but no planned schedule or coroutine step
    /// (runs `fn` with a pseudo-system that can create/mutate
    /// entities outside the frame loop"). Shape changes made here are
    /// visible to queries immediately, the same as inside a system, since
    /// `add`/`remove`/`delete` always update membership synchronously.
    pub fn build(&mut self, f: impl FnOnce(&mut World) -> WorldResult<()>) -> WorldResult<()> {
        f(self)
    }

    // --- Frame execution ---------------------------------------------

    /// Runs one frame: flushes the shape journal into query membership,
    /// advances every limbo window, runs the planned schedule in lane order,
    /// and steps every live coroutine. Marks the world unhealthy and stops
    /// short on the first capacity/internal error.
    pub fn execute(&mut self) -> WorldResult<()> {
        if !self.healthy {
            return Err(WorldError::internal("execute called on an unhealthy world"));
        }
        if self.schedule.is_none() {
            self.build_schedule()?;
        }

        self.frame_number += 1;
        tracing::debug!(frame = self.frame_number, "frame begin");
        self.registry.set_current_frame(self.frame_number);
        self.queries.begin_frame();
        self.ref_index.begin_frame();

        if let Err(e) = self.flush_shape_journal() {
            self.mark_unhealthy_if_fatal(&e);
            return Err(e);
        }

        self.registry.advance_limbo();
        for store in &mut self.stores {
            store.advance_limbo(self.frame_number, self.config.limbo_frames);
        }
        self.ref_index.advance_limbo(self.frame_number, self.config.ref_stale_frames);

        let order: Vec<usize> = {
            let (graph, _) = self.schedule.as_ref().unwrap();
            graph.topologically_sorted_vertices()?.to_vec()
        };

        // Systems are detached from `self` for the duration of the run so
        // each `execute` call can take `&mut World` without aliasing the
        // `Vec` it was pulled from.
        let mut systems = std::mem::take(&mut self.systems);
        let mut run_err = None;
        for system_id in order {
            let scheduled = &mut systems[system_id];
            tracing::trace!(system = scheduled.system.name(), lane = scheduled.lane, frame = self.frame_number, "executing system");
            if let Err(e) = scheduled.system.execute(self) {
                run_err = Some(e);
                break;
            }
        }
        self.systems = systems;
        if let Some(e) = run_err {
            self.mark_unhealthy_if_fatal(&e);
            return Err(e);
        }

        if let Err(e) = self.coroutines.advance_frame(self.config.frame_seconds, |_| false) {
            self.mark_unhealthy_if_fatal(&e);
            return Err(e);
        }

        Ok(())
    }

    fn mark_unhealthy_if_fatal(&mut self, err: &WorldError) {
        if err.is_fatal_to_world() {
            self.healthy = false;
        }
    }

    /// Drains the shape journal accumulated since the previous frame. Query
    /// membership is already current — `add`/`remove`/`delete` update it
    /// synchronously so systems later in the same frame observe it — so this
    /// pass only has to sever back-references for entities that were
    /// deleted.
    fn flush_shape_journal(&mut self) -> WorldResult<()> {
        let events = self.registry.drain_journal();
        for event in &events {
            if event.op == ShapeOp::Delete {
                let refs = self.ref_index.all_refs(event.entity, false);
                for r in refs {
                    self.ref_index.unlink(event.entity, r, event.frame)?;
                }
            }
        }
        Ok(())
    }

    pub fn terminate(&mut self) {
        self.healthy = false;
        for i in 0..self.coroutines_len() {
            self.coroutines.cancel(i, CancelTrigger::WorldTerminated);
        }
    }

    fn coroutines_len(&self) -> usize {
        // Best-effort upper bound: coroutine ids are dense from spawn order.
        let mut n = 0;
        while self.coroutines.state(n).is_some() {
            n += 1;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::FieldKind;
    use crate::coroutine::{StepOutcome, YieldPoint};

    fn simple_world() -> World {
        let defs = vec![ComponentTypeDef::new("Position")
            .field("x", FieldKind::F32)
            .field("y", FieldKind::F32)];
        World::create(defs, WorldConfig::default()).unwrap()
    }

    #[test]
    fn create_add_read_round_trip() {
        let mut world = simple_world();
        let pos = world.component_type_id("Position").unwrap();
        let e = world.create_entity().unwrap();
        world.add(e, pos).unwrap();

        {
            let acc = world.write(e, pos).unwrap();
            acc.set_f32(0, 1.5).unwrap();
        }
        let acc = world.read(e, pos).unwrap();
        assert_eq!(acc.get_f32(0).unwrap(), 1.5);
    }

    #[test]
    fn delete_then_execute_advances_frame() {
        let mut world = simple_world();
        let pos = world.component_type_id("Position").unwrap();
        let e = world.create_entity().unwrap();
        world.add(e, pos).unwrap();
        world.delete(e).unwrap();
        world.execute().unwrap();
        assert_eq!(world.frame_number(), 1);
        assert!(world.is_healthy());
    }

    #[test]
    fn singleton_survives_world_lifetime() {
        let world = simple_world();
        assert_eq!(world.singleton().index(), SINGLETON_INDEX);
    }

    #[test]
    fn build_runs_outside_the_frame_loop() {
        let mut world = simple_world();
        let pos = world.component_type_id("Position").unwrap();
        world
            .build(|w| {
                let e = w.create_entity()?;
                w.add(e, pos)?;
                Ok(())
            })
            .unwrap();
        assert_eq!(world.frame_number(), 0);
    }

    #[test]
    fn joined_refs_filters_by_presence_mask() {
        let defs = vec![
            ComponentTypeDef::new("GlobalDest"),
            ComponentTypeDef::new("Origin").field("target", FieldKind::Ref),
            ComponentTypeDef::new("Tag"),
        ];
        let mut world = World::create(defs, WorldConfig::default()).unwrap();
        let dest_ty = world.component_type_id("GlobalDest").unwrap();
        let origin_ty = world.component_type_id("Origin").unwrap();
        let tag_ty = world.component_type_id("Tag").unwrap();

        let d = world.create_entity().unwrap();
        world.add(d, dest_ty).unwrap();

        let tagged = world.create_entity().unwrap();
        world.add(tagged, origin_ty).unwrap();
        world.add(tagged, tag_ty).unwrap();
        world.write_ref(tagged, origin_ty, 0, Some(d)).unwrap();

        let untagged = world.create_entity().unwrap();
        world.add(untagged, origin_ty).unwrap();
        world.write_ref(untagged, origin_ty, 0, Some(d)).unwrap();

        let filter = crate::bitset::ComponentMask::default().require(tag_ty);
        let joined = world.joined_refs(d, origin_ty, &filter);
        assert_eq!(joined, vec![tagged]);
    }

    #[test]
    fn named_join_resolves_through_a_registered_query() {
        let defs = vec![
            ComponentTypeDef::new("GlobalDest"),
            ComponentTypeDef::new("Origin").field("target", FieldKind::Ref),
            ComponentTypeDef::new("Tag"),
        ];
        let mut world = World::create(defs, WorldConfig::default()).unwrap();
        let dest_ty = world.component_type_id("GlobalDest").unwrap();
        let origin_ty = world.component_type_id("Origin").unwrap();
        let tag_ty = world.component_type_id("Tag").unwrap();

        let d = world.create_entity().unwrap();
        world.add(d, dest_ty).unwrap();

        let tagged = world.create_entity().unwrap();
        world.add(tagged, origin_ty).unwrap();
        world.add(tagged, tag_ty).unwrap();
        world.write_ref(tagged, origin_ty, 0, Some(d)).unwrap();

        let untagged = world.create_entity().unwrap();
        world.add(untagged, origin_ty).unwrap();
        world.write_ref(untagged, origin_ty, 0, Some(d)).unwrap();

        let def = QueryDef::new().with_component(dest_ty).join(
            "originators",
            origin_ty,
            crate::bitset::ComponentMask::default().require(tag_ty),
        );
        let query = world.register_query(def);

        let joined = world.joined(query, d, "originators").unwrap();
        assert_eq!(joined, vec![tagged]);

        let err = world.joined(query, d, "missing").unwrap_err();
        assert!(matches!(err, WorldError::Internal(_)));
    }

    #[test]
    fn failed_validator_still_leaves_query_membership_in_sync() {
        let mut world = simple_world();
        let pos = world.component_type_id("Position").unwrap();
        world.register_validator(pos, "always_rejects", Box::new(|_presence| false));

        let query = world.register_query(QueryDef::new().with_component(pos));

        let e = world.create_entity().unwrap();
        let err = world.add(e, pos).unwrap_err();
        assert!(matches!(err, WorldError::InvalidShape { .. }));

        // The component was actually attached and the shape event already
        // flushed to the query before validation ran, so membership must
        // still reflect it even though `add` itself returned an error.
        assert!(world.has(e, pos));
        assert!(world.query(query).contains(e.index()));
    }

    #[test]
    fn deleting_entity_cancels_its_scoped_coroutine() {
        let mut world = simple_world();
        let pos = world.component_type_id("Position").unwrap();
        let e = world.create_entity().unwrap();
        world.add(e, pos).unwrap();

        let scope = CoroutineScope { entity_index: e.index(), required_component: None };
        let id = world.spawn_scoped_coroutine(None, Box::new(|| StepOutcome::Yield(YieldPoint::Indefinite)), Some(scope), None);

        world.delete(e).unwrap();

        assert_eq!(
            world.coroutine_state(id),
            Some(crate::coroutine::CoroutineState::Cancelled(CancelTrigger::OwningEntityDeleted))
        );
    }

    #[test]
    fn removing_scoped_component_cancels_its_coroutine() {
        let mut world = simple_world();
        let pos = world.component_type_id("Position").unwrap();
        let e = world.create_entity().unwrap();
        world.add(e, pos).unwrap();

        let scope = CoroutineScope { entity_index: e.index(), required_component: Some(pos) };
        let id = world.spawn_scoped_coroutine(None, Box::new(|| StepOutcome::Yield(YieldPoint::Indefinite)), Some(scope), None);

        world.remove(e, pos).unwrap();

        assert_eq!(
            world.coroutine_state(id),
            Some(crate::coroutine::CoroutineState::Cancelled(CancelTrigger::OwningComponentRemoved))
        );
    }
}
