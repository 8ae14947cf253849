//! The six-kind error taxonomy of the runtime.
//!
//! Configuration errors abort world construction. Capacity and internal
//! errors are fatal to the current frame and mark the world unhealthy.
//! Shape and access errors are local to the call that raised them.

use thiserror::Error;

use crate::entity::Entity;

/// Identifies a system by its registration name, for error reporting.
pub type SystemName = String;

#[derive(Error, Debug, Clone)]
pub enum WorldError {
    #[error("unknown system referenced in schedule directive: {0}")]
    UnknownSystemReferenced(SystemName),

    #[error("system {0:?} is registered more than once")]
    DuplicateSystem(SystemName),

    #[error("component type {0:?} is registered more than once")]
    DuplicateComponentType(String),

    #[error("schedule cycle detected among systems: {systems:?}")]
    CycleDetected { systems: Vec<SystemName> },

    #[error("conflicting schedule directives between {a} and {b}")]
    ConflictingScheduleDirectives { a: SystemName, b: SystemName },

    #[error("entity pool exhausted: {limit} entities configured, all in use")]
    EntityCapacityExceeded { limit: usize },

    #[error("component pool exhausted for {type_name}: {limit} rows configured")]
    ComponentCapacityExceeded { type_name: String, limit: usize },

    #[error("limbo entity buffer exhausted: {limit} configured")]
    LimboEntityCapacityExceeded { limit: usize },

    #[error("limbo component buffer exhausted: {limit} configured")]
    LimboComponentCapacityExceeded { limit: usize },

    #[error("shape journal exhausted: {limit} shape changes configured per frame")]
    ShapeJournalCapacityExceeded { limit: usize },

    #[error("ref delta ring exhausted: {limit} ref changes configured per frame")]
    RefJournalCapacityExceeded { limit: usize },

    #[error("entity {entity:?} does not satisfy a declared shape invariant on {type_name}")]
    InvalidShape {
        entity: Entity,
        type_name: &'static str,
    },

    #[error("stale component accessor reused for entity {entity:?} on {type_name}")]
    StaleAccessor {
        entity: Entity,
        type_name: &'static str,
    },

    #[error("system {system} attempted to write {type_name} without declaring it in its usage set")]
    UndeclaredWrite {
        system: SystemName,
        type_name: &'static str,
    },

    #[error("read of removed component {type_name} on {entity:?} without accessRecentlyDeletedData()")]
    StaleComponentRead {
        entity: Entity,
        type_name: &'static str,
    },

    #[error("coroutine cancelled")]
    Cancelled,

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl WorldError {
    pub fn internal(msg: impl Into<String>) -> Self {
        WorldError::Internal(msg.into())
    }

    /// True for the kinds that abort world construction outright.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            WorldError::UnknownSystemReferenced(_)
                | WorldError::DuplicateSystem(_)
                | WorldError::DuplicateComponentType(_)
                | WorldError::CycleDetected { .. }
                | WorldError::ConflictingScheduleDirectives { .. }
        )
    }

    /// True for the kinds that mark the world unhealthy.
    pub fn is_fatal_to_world(&self) -> bool {
        matches!(
            self,
            WorldError::EntityCapacityExceeded { .. }
                | WorldError::ComponentCapacityExceeded { .. }
                | WorldError::LimboEntityCapacityExceeded { .. }
                | WorldError::LimboComponentCapacityExceeded { .. }
                | WorldError::ShapeJournalCapacityExceeded { .. }
                | WorldError::RefJournalCapacityExceeded { .. }
                | WorldError::Internal(_)
        )
    }
}

pub type WorldResult<T> = Result<T, WorldError>;
