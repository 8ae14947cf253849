//! System declaration: a named unit of per-frame logic with a declared
//! read/write set and optional schedule directives.
//!
//! `SystemAccess` captures the read/write set a system declares up front;
//! `SystemBuilder`'s fluent `.reads(...).writes(...).build(run_fn)` chain
//! resolves that access set from host-supplied `ComponentTypeId`s at
//! declaration time rather than from Rust generic types at compile time.

use crate::component::ComponentTypeId;
use crate::error::WorldResult;
use crate::planner::{ScheduleDirective, SystemAccess, SystemDecl, SystemId};
use crate::world::World;

/// The three phases a system runs through over its lifetime in the world.
pub trait System: Send + Sync {
    fn name(&self) -> &str;

    fn access(&self) -> &SystemAccess;

    fn directives(&self) -> &[ScheduleDirective];

    fn initialize(&mut self, _world: &mut World) -> WorldResult<()> {
        Ok(())
    }

    fn execute(&mut self, world: &mut World) -> WorldResult<()>;

    fn finalize(&mut self, _world: &mut World) -> WorldResult<()> {
        Ok(())
    }
}

/// A `System` built from plain closures, for the common case of a system
/// with no state beyond what its closures capture.
pub struct ClosureSystem<E> {
    name: String,
    access: SystemAccess,
    directives: Vec<ScheduleDirective>,
    execute_fn: E,
}

impl<E> ClosureSystem<E>
where
    E: FnMut(&mut World) -> WorldResult<()> + Send + Sync,
{
    pub fn decl(&self) -> SystemDecl {
        SystemDecl {
            name: self.name.clone(),
            access: self.access.clone(),
            directives: self.directives.clone(),
        }
    }
}

impl<E> System for ClosureSystem<E>
where
    E: FnMut(&mut World) -> WorldResult<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn access(&self) -> &SystemAccess {
        &self.access
    }

    fn directives(&self) -> &[ScheduleDirective] {
        &self.directives
    }

    fn execute(&mut self, world: &mut World) -> WorldResult<()> {
        (self.execute_fn)(world)
    }
}

/// Fluent declaration of a system's name, read/write set, and schedule
/// directives.
pub struct SystemBuilder {
    name: String,
    access: SystemAccess,
    directives: Vec<ScheduleDirective>,
}

impl SystemBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        SystemBuilder {
            name: name.into(),
            access: SystemAccess::default(),
            directives: Vec::new(),
        }
    }

    pub fn reads(mut self, type_id: ComponentTypeId) -> Self {
        self.access.reads.push(type_id);
        self
    }

    pub fn writes(mut self, type_id: ComponentTypeId) -> Self {
        self.access.writes.push(type_id);
        self
    }

    pub fn before(mut self, system: SystemId) -> Self {
        self.directives.push(ScheduleDirective::Before(system));
        self
    }

    pub fn after(mut self, system: SystemId) -> Self {
        self.directives.push(ScheduleDirective::After(system));
        self
    }

    pub fn before_readers_of(mut self, type_id: ComponentTypeId) -> Self {
        self.directives.push(ScheduleDirective::BeforeReadersOf(type_id));
        self
    }

    pub fn before_writers_of(mut self, type_id: ComponentTypeId) -> Self {
        self.directives.push(ScheduleDirective::BeforeWritersOf(type_id));
        self
    }

    pub fn on_main_thread(mut self) -> Self {
        self.access.main_thread = true;
        self.directives.push(ScheduleDirective::OnMainThread);
        self
    }

    pub fn on_many_threads(mut self) -> Self {
        self.access.main_thread = false;
        self.directives.push(ScheduleDirective::OnManyThreads);
        self
    }

    pub fn build<E>(self, execute_fn: E) -> ClosureSystem<E>
    where
        E: FnMut(&mut World) -> WorldResult<()> + Send + Sync,
    {
        ClosureSystem {
            name: self.name,
            access: self.access,
            directives: self.directives,
            execute_fn,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates_access_and_directives() {
        let sys = SystemBuilder::new("movement")
            .reads(0)
            .writes(1)
            .before_readers_of(2)
            .build(|_world| Ok(()));

        assert_eq!(sys.name(), "movement");
        assert_eq!(sys.access().reads, vec![0]);
        assert_eq!(sys.access().writes, vec![1]);
        assert_eq!(sys.directives().len(), 1);
    }
}
