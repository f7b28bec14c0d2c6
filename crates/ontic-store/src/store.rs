use std::collections::BTreeSet;
use std::fmt;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::{
    Entity, EntityId, IntegrityStatus, Layer, OntologicalState, Reference, ReferenceId,
    Revalidation,
};
use crate::{StoreError, StoreResult};

/// Exclusive owner of every entity and reference record.
///
/// Each collection sits behind its own reader/writer lock. Writes hold the
/// exclusive lock only for the mutation itself; reads clone records out
/// under the shared lock, so enumeration never holds a lock while the
/// caller iterates. Records are never deleted, which lets a record's id
/// double as its slot: id `n` lives at index `n - 1`.
pub struct EntityStore {
    entities: RwLock<Vec<Entity>>,
    references: RwLock<Vec<Reference>>,
    next_entity_id: AtomicU64,
    next_reference_id: AtomicU64,
}

impl EntityStore {
    pub fn new() -> Self {
        EntityStore {
            entities: RwLock::new(Vec::new()),
            references: RwLock::new(Vec::new()),
            next_entity_id: AtomicU64::new(0),
            next_reference_id: AtomicU64::new(0),
        }
    }

    /// Creates an entity and returns its id. Never fails.
    pub fn create_entity(
        &self,
        name: impl Into<String>,
        attributes: Vec<String>,
        state: OntologicalState,
        layer: Layer,
    ) -> EntityId {
        let mut entities = self.entities.write().unwrap();
        // Bumped only under the write lock, so id == index + 1 holds.
        let id = self.next_entity_id.fetch_add(1, Ordering::Relaxed) + 1;
        entities.push(Entity {
            id,
            name: name.into(),
            attributes,
            state,
            temporal_layer: layer,
            incoming_references: BTreeSet::new(),
            outgoing_references: BTreeSet::new(),
        });
        id
    }

    /// Creates a reference and returns its id.
    ///
    /// Neither endpoint has to exist: a reference may be created before,
    /// and may outlive, the entities it names. New references start
    /// `Valid`, validated at their creation layer.
    pub fn create_reference(
        &self,
        source: EntityId,
        target: EntityId,
        target_state_at_creation: OntologicalState,
        layer: Layer,
    ) -> ReferenceId {
        let mut references = self.references.write().unwrap();
        let id = self.next_reference_id.fetch_add(1, Ordering::Relaxed) + 1;
        references.push(Reference {
            id,
            source_entity_id: source,
            target_entity_id: target,
            target_state_at_creation,
            creation_layer: layer,
            last_validated_layer: layer,
            integrity_status: IntegrityStatus::Valid,
            candidate_targets: BTreeSet::new(),
        });
        id
    }

    /// Returns the entity, or `None` if `id` was never assigned. Absence is
    /// an expected outcome, not an error.
    pub fn get_entity(&self, id: EntityId) -> Option<Entity> {
        slot(&self.entities.read().unwrap(), id).cloned()
    }

    pub fn get_reference(&self, id: ReferenceId) -> Option<Reference> {
        slot(&self.references.read().unwrap(), id).cloned()
    }

    /// Point-in-time snapshot of every entity.
    pub fn all_entities(&self) -> Vec<Entity> {
        self.entities.read().unwrap().clone()
    }

    /// Point-in-time snapshot of every reference.
    pub fn all_references(&self) -> Vec<Reference> {
        self.references.read().unwrap().clone()
    }

    /// Snapshot of every reference whose target is `target`.
    pub fn references_targeting(&self, target: EntityId) -> Vec<Reference> {
        self.references
            .read()
            .unwrap()
            .iter()
            .filter(|reference| reference.target_entity_id == target)
            .cloned()
            .collect()
    }

    /// Moves an entity to a new state and layer. Layers never move
    /// backwards.
    pub fn update_entity_state(
        &self,
        id: EntityId,
        state: OntologicalState,
        layer: Layer,
    ) -> StoreResult<()> {
        let mut entities = self.entities.write().unwrap();
        let entity = slot_mut(&mut entities, id).ok_or(StoreError::EntityNotFound(id))?;
        if layer < entity.temporal_layer {
            return Err(StoreError::LayerRegression {
                entity: id,
                requested: layer,
                current: entity.temporal_layer,
            });
        }
        entity.state = state;
        entity.temporal_layer = layer;
        Ok(())
    }

    pub fn append_attribute(&self, id: EntityId, attribute: impl Into<String>) -> StoreResult<()> {
        let mut entities = self.entities.write().unwrap();
        let entity = slot_mut(&mut entities, id).ok_or(StoreError::EntityNotFound(id))?;
        entity.attributes.push(attribute.into());
        Ok(())
    }

    /// Adds `reference` to `entity`'s outgoing set. Wiring an entity to a
    /// reference is its own critical section; there is no joint atomicity
    /// with creating either record.
    pub fn record_outgoing(&self, entity: EntityId, reference: ReferenceId) -> StoreResult<()> {
        let mut entities = self.entities.write().unwrap();
        let record = slot_mut(&mut entities, entity).ok_or(StoreError::EntityNotFound(entity))?;
        record.outgoing_references.insert(reference);
        Ok(())
    }

    /// Adds `reference` to `entity`'s incoming set.
    pub fn record_incoming(&self, entity: EntityId, reference: ReferenceId) -> StoreResult<()> {
        let mut entities = self.entities.write().unwrap();
        let record = slot_mut(&mut entities, entity).ok_or(StoreError::EntityNotFound(entity))?;
        record.incoming_references.insert(reference);
        Ok(())
    }

    /// Applies one revalidation outcome to one reference.
    ///
    /// Candidates survive only under `Unresolved`; every other status
    /// clears them, keeping `candidate_targets` non-empty exactly when the
    /// status is `Unresolved`.
    pub fn apply_revalidation(&self, id: ReferenceId, outcome: Revalidation) -> StoreResult<()> {
        let mut references = self.references.write().unwrap();
        let reference = slot_mut(&mut references, id).ok_or(StoreError::ReferenceNotFound(id))?;
        reference.integrity_status = outcome.status;
        reference.candidate_targets = if outcome.status == IntegrityStatus::Unresolved {
            outcome.candidate_targets
        } else {
            BTreeSet::new()
        };
        if let Some(layer) = outcome.layer {
            reference.last_validated_layer = layer;
        }
        Ok(())
    }

    pub fn entity_count(&self) -> usize {
        self.entities.read().unwrap().len()
    }

    pub fn reference_count(&self) -> usize {
        self.references.read().unwrap().len()
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityStore")
            .field("entities", &self.entity_count())
            .field("references", &self.reference_count())
            .finish()
    }
}

fn slot<T>(records: &[T], id: u64) -> Option<&T> {
    if id == 0 {
        return None;
    }
    records.get(id as usize - 1)
}

fn slot_mut<T>(records: &mut [T], id: u64) -> Option<&mut T> {
    if id == 0 {
        return None;
    }
    records.get_mut(id as usize - 1)
}
