//! Tessera ECS -- an archetype entity store with relationships and queries.
//!
//! Entities live in tables, one per unique sorted set of ids (components,
//! tags and `(relationship, target)` pairs), with one column per data
//! component. A component index maps every id, including wildcard forms
//! such as `(ChildOf, *)`, to the tables that contain it. Adding or removing
//! an id moves the entity along a cached table graph edge.
//!
//! Queries compile into a small op program that a backtracking cursor runs
//! against the store; see [`query`].
//!
//! # Quick Start
//!
//! ```
//! use tessera_ecs::prelude::*;
//!
//! #[derive(Debug, Default, Clone, PartialEq)]
//! struct Position { x: f32, y: f32 }
//!
//! #[derive(Debug, Default, Clone, PartialEq)]
//! struct Velocity { dx: f32, dy: f32 }
//!
//! let mut world = World::new();
//! let pos = world.register_component::<Position>("Position");
//! let vel = world.register_component::<Velocity>("Velocity");
//!
//! let e = world.new_entity();
//! world.set(e, Position { x: 0.0, y: 0.0 }).unwrap();
//! world.set(e, Velocity { dx: 1.0, dy: 0.0 }).unwrap();
//!
//! let query = world.query(&QueryDesc::new().with(pos).with(vel)).unwrap();
//! world
//!     .each_mut(&query, |m| {
//!         if let Some((p, v)) = m.fields_mut::<Position, Velocity>(0, 1) {
//!             for (p, v) in p.iter_mut().zip(v.iter()) {
//!                 p.x += v.dx;
//!             }
//!         }
//!     })
//!     .unwrap();
//!
//! assert_eq!(world.get::<Position>(e), Some(&Position { x: 1.0, y: 0.0 }));
//! ```

#![deny(unsafe_code)]

pub mod cleanup;
#[allow(unsafe_code)]
pub mod column;
#[allow(unsafe_code)]
pub mod commands;
#[allow(unsafe_code)]
pub mod component;
pub mod component_index;
pub mod config;
pub mod entity;
pub mod hash;
pub mod id;
#[allow(unsafe_code)]
pub mod mutation;
pub mod observer;
#[allow(unsafe_code)]
pub mod query;
#[allow(unsafe_code)]
pub mod sparse;
#[allow(unsafe_code)]
pub mod table;
pub mod table_graph;
#[allow(unsafe_code)]
pub mod world;

use crate::entity::EntityId;
use crate::id::Id;
use crate::table::TableId;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by store and query operations.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// The entity is not alive (deleted, stale generation or never created).
    #[error("entity {entity} is not alive")]
    StaleEntity { entity: EntityId },

    #[error("invalid parameter: {reason}")]
    InvalidParameter { reason: String },

    /// The id cannot be used for the requested operation.
    #[error("invalid id {id}: {reason}")]
    InvalidId { id: Id, reason: String },

    /// The id has no component type registered for it.
    #[error("'{name}' is not a registered component")]
    UnknownComponent { name: String },

    /// A typed access used the wrong Rust type.
    #[error("type mismatch for {id}: expected {expected}, found {found}")]
    TypeMismatch {
        id: String,
        expected: String,
        found: String,
    },

    /// A relationship constraint (`Relationship`, `Target`, `OneOf`,
    /// `Final`) rejected the id.
    #[error("constraint violated by {id}: {reason}")]
    ConstraintViolated { id: String, reason: String },

    #[error("invalid operation: {reason}")]
    InvalidOperation { reason: String },

    /// A structural change hit a table that is being iterated.
    #[error("{table} is locked by an active iteration")]
    LockedStorage { table: TableId },

    /// The id is referenced by a live query and cannot be deleted.
    #[error("{id} is used by a query")]
    IdInUseByQuery { id: String },

    #[error("invalid query: {reason}")]
    InvalidQuery { reason: String },
}

/// Abort on a broken internal invariant.
#[doc(hidden)]
#[macro_export]
macro_rules! ecs_internal {
    ($($arg:tt)*) => {
        panic!("internal error: {}", format_args!($($arg)*))
    };
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::commands::ApplyReport;
    pub use crate::component::TypeHooks;
    pub use crate::config::WorldConfig;
    pub use crate::entity::EntityId;
    pub use crate::id::{builtin, Id};
    pub use crate::observer::{Event, EventIter, ObserverDesc};
    pub use crate::query::{
        InOut, MatchMut, Oper, Query, QueryCursor, QueryDesc, QueryMatch, Term, TermItem, TermRef,
    };
    pub use crate::table::TableId;
    pub use crate::world::{World, WorldStats};
    pub use crate::EcsError;
}
