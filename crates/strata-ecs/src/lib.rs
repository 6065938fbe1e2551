//! Strata ECS -- chunked, archetype-based entity/component storage.
//!
//! Entities that share an identical set of component types live in one
//! [`Archetype`](archetype::Archetype). Each archetype packs its rows into
//! fixed-size chunks with one column per component type, keeps every chunk
//! but the last completely full, and moves entities between archetypes as
//! their component sets change. Component values are type-erased behind the
//! function tables in [`ComponentRuntimeInfo`](component::ComponentRuntimeInfo),
//! and chunk memory comes from a pluggable
//! [`ChunkAllocator`](allocator::ChunkAllocator).
//!
//! # Quick Start
//!
//! ```
//! use strata_ecs::prelude::*;
//!
//! #[derive(Debug, Default, PartialEq)]
//! struct Position { x: f32, y: f32 }
//!
//! #[derive(Debug, Default, PartialEq)]
//! struct Velocity { dx: f32, dy: f32 }
//!
//! let mut world = World::new();
//! world.register_component::<Position>("position");
//! world.register_component::<Velocity>("velocity");
//!
//! let entity = world.spawn_with(Position { x: 1.0, y: 2.0 }).unwrap();
//! world.insert_component(entity, Velocity { dx: 0.5, dy: 0.0 }).unwrap();
//!
//! assert_eq!(world.get_component::<Position>(entity), Some(&Position { x: 1.0, y: 2.0 }));
//! assert!(world.has_component::<Velocity>(entity));
//! ```

#![deny(unsafe_code)]

#[allow(unsafe_code)]
pub mod allocator;
#[allow(unsafe_code)]
pub mod archetype;
#[allow(unsafe_code)]
pub mod component;
pub mod config;
pub mod entity;
pub mod world;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Recoverable errors produced by store operations.
///
/// Misuse of the storage core (foreign entity locations, unsorted match
/// keys, re-finalized layouts, transfers that would have to invent
/// component values) panics instead.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The chunk allocator could not provide a block.
    #[error("chunk allocation of {bytes} bytes (align {align}) failed")]
    AllocationFailed { bytes: usize, align: usize },

    /// The entity does not exist (stale generation or never allocated).
    #[error("entity {entity:?} does not exist (stale or never allocated)")]
    StaleEntity { entity: entity::EntityId },

    /// A component type was used before being registered.
    #[error("component type '{name}' not registered")]
    UnknownComponent { name: String },

    /// A store configuration failed to parse or validate.
    #[error("invalid store configuration: {details}")]
    InvalidConfig { details: String },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::allocator::{
        ChunkAllocator, ChunkPool, CountingAllocator, NullAllocator, SystemAllocator,
    };
    pub use crate::archetype::{Archetype, ArchetypeId, ChunkView, ComponentSlot, Relocation};
    pub use crate::component::{ComponentRegistry, ComponentRuntimeInfo, ComponentTypeId};
    pub use crate::config::StoreConfig;
    pub use crate::entity::{EntityData, EntityId};
    pub use crate::world::World;
    pub use crate::StoreError;
}
