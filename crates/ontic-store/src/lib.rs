//! Entity and reference records with reader/writer-guarded, in-memory storage.
//!
//! The store owns every record for the process lifetime. Records are created
//! once and never deleted; a collapsed entity is a state, not a removed
//! record. Entity ids and reference ids come from independent monotonic
//! counters and are unrelated to the durable ids issued by the identity
//! registry.

mod store;
mod types;

pub use store::EntityStore;
pub use types::{
    Entity, EntityId, IntegrityStatus, Layer, OntologicalState, Reference, ReferenceId,
    Revalidation,
};

use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no entity with id {0}")]
    EntityNotFound(EntityId),
    #[error("no reference with id {0}")]
    ReferenceNotFound(ReferenceId),
    #[error("layer {requested} would move entity {entity} backwards from layer {current}")]
    LayerRegression {
        entity: EntityId,
        requested: Layer,
        current: Layer,
    },
}
