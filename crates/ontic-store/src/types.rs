use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Entity ids are 1-based and assigned from a monotonic counter.
pub type EntityId = u64;
/// Reference ids are 1-based and counted independently of entity ids.
pub type ReferenceId = u64;
/// Temporal layers are non-negative and non-decreasing per entity.
pub type Layer = u64;

/// Interpretive status of an entity. The set is closed; no transitions are
/// defined beyond the ones the integrity policy reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OntologicalState {
    Undefined,
    Defined,
    Referenced,
    Reinterpreted,
    Contradicted,
    Split,
    Merged,
    Abstracted,
    ObserverRelative,
    Collapsed,
}

/// Derived validity of a reference given the state its target has now,
/// relative to the state it had when the reference was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityStatus {
    Valid,
    IdentityChanged,
    /// Reserved. Split targets currently resolve to `Unresolved`; the
    /// variant is kept so the status set stays stable.
    IdentitySplit,
    IdentityMerged,
    Invalidated,
    Unresolved,
    ObserverRelative,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub attributes: Vec<String>,
    pub state: OntologicalState,
    pub temporal_layer: Layer,
    pub incoming_references: BTreeSet<ReferenceId>,
    pub outgoing_references: BTreeSet<ReferenceId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub id: ReferenceId,
    pub source_entity_id: EntityId,
    pub target_entity_id: EntityId,
    /// Snapshot of the target's state when the reference was made.
    pub target_state_at_creation: OntologicalState,
    pub creation_layer: Layer,
    pub last_validated_layer: Layer,
    pub integrity_status: IntegrityStatus,
    /// Successor entities this reference might now resolve to. Non-empty
    /// exactly when `integrity_status` is `Unresolved`.
    pub candidate_targets: BTreeSet<EntityId>,
}

/// Outcome of evaluating one reference against its target's current state,
/// ready to be applied by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revalidation {
    pub status: IntegrityStatus,
    /// Kept only when `status` is `Unresolved`; cleared otherwise.
    pub candidate_targets: BTreeSet<EntityId>,
    /// New `last_validated_layer` stamp; `None` leaves the current one.
    pub layer: Option<Layer>,
}
