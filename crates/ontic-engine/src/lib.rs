//! Referential integrity over the entity store.
//!
//! The engine keeps every reference's status consistent with the state of
//! the entity it targets: when an entity is redefined, split, merged, or
//! collapsed, each incoming reference is reclassified against the state it
//! was created under. The transformation boundary turns proposals from an
//! external decision process into store mutations plus one propagation
//! sweep, the chain module audits an identity's surface lineage for
//! recursion, and the observer module renders per-observer views of the
//! resulting entities.

mod chain;
mod integrity;
mod observer;
mod transform;

pub use chain::IdentityChain;
pub use integrity::{IntegrityEngine, PropagationReport, SplitMap, classify};
pub use observer::{Interpretation, Observer, interpret_all};
pub use transform::{AppliedTransformation, TransformSession, TransformationProposal};

use ontic_registry::RegistryError;
use ontic_store::{EntityId, StoreError};
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A split transition arrived without successor candidates. Rejected at
    /// the boundary so no reference is ever left `Unresolved` with an empty
    /// candidate set.
    #[error("split of entity {entity} carries no candidate targets")]
    InvalidSplitTransition { entity: EntityId },
    #[error("store rejected a mutation: {0}")]
    Store(#[from] StoreError),
    #[error("identity registry failure: {0}")]
    Registry(#[from] RegistryError),
    #[error("malformed transformation proposal: {0}")]
    Proposal(#[from] serde_json::Error),
}
