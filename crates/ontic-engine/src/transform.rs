use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use ontic_registry::{IdentityId, IdentityRegistry};
use ontic_store::{EntityId, EntityStore, Layer, OntologicalState, StoreError};

use crate::EngineResult;
use crate::chain::IdentityChain;
use crate::integrity::{IntegrityEngine, PropagationReport};

/// One transformation decided by the external proposal service, as it
/// arrives on the wire.
///
/// The surface lists drive what happens: no successor surface collapses
/// the entity, one redefines it in place, several split it. `kind` is the
/// proposer's label for the change; it is carried into the history but
/// never interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformationProposal {
    pub identity_key: String,
    #[serde(rename = "from")]
    pub from_surface: String,
    #[serde(rename = "to")]
    pub to_surfaces: Vec<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub layer: Layer,
}

impl TransformationProposal {
    pub fn from_json(json: &str) -> EngineResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> EngineResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// One proposal the session carried out, kept in the session history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedTransformation {
    pub proposal: TransformationProposal,
    /// The entity bound to the proposal's identity key.
    pub entity_id: EntityId,
    /// Durable id of the identity key in the registry.
    pub identity: IdentityId,
    /// Successor entities, in surface order. Empty unless the proposal
    /// split the entity.
    pub created_entities: Vec<EntityId>,
    pub report: PropagationReport,
}

/// Applies external transformation proposals to the store.
///
/// The session remembers which entity each identity key named earlier in
/// the run, registers keys it has never seen, and funnels every state
/// change through one propagation sweep. Registry ids and entity ids stay
/// separate spaces; the binding map is the only place they meet.
pub struct TransformSession<'a> {
    registry: &'a IdentityRegistry,
    store: &'a EntityStore,
    engine: IntegrityEngine<'a>,
    bindings: BTreeMap<String, EntityId>,
    history: Vec<AppliedTransformation>,
}

impl<'a> TransformSession<'a> {
    pub fn new(registry: &'a IdentityRegistry, store: &'a EntityStore) -> Self {
        TransformSession {
            registry,
            store,
            engine: IntegrityEngine::new(store),
            bindings: BTreeMap::new(),
            history: Vec::new(),
        }
    }

    /// Carries out one proposal.
    ///
    /// A first-seen identity key is registered and given a fresh entity in
    /// state `Defined`, named by the proposal's source surface, at the
    /// proposal's layer. The entity then moves according to the successor
    /// surfaces: none collapses it, one appends the surface as an
    /// attribute and reinterprets it, several create one `Split` successor
    /// per surface (each inheriting the parent's attributes, registered
    /// and bound under its own surface). Every path ends in a propagation
    /// sweep over the entity's incoming references. A proposal refused by
    /// the registry or the store leaves the store unchanged.
    pub fn apply(
        &mut self,
        proposal: TransformationProposal,
    ) -> EngineResult<AppliedTransformation> {
        let identity = self.ensure_identity(&proposal.identity_key)?;
        let new_state = match proposal.to_surfaces.len() {
            0 => OntologicalState::Collapsed,
            1 => OntologicalState::Reinterpreted,
            _ => OntologicalState::Split,
        };
        // All registry work happens before the store moves: a full registry
        // refuses the proposal here, not mid-split.
        if new_state == OntologicalState::Split {
            for surface in &proposal.to_surfaces {
                self.ensure_identity(surface)?;
            }
        }

        let entity_id = match self.bindings.get(&proposal.identity_key).copied() {
            Some(id) => id,
            None => {
                let id = self.store.create_entity(
                    &proposal.from_surface,
                    Vec::new(),
                    OntologicalState::Defined,
                    proposal.layer,
                );
                self.bindings.insert(proposal.identity_key.clone(), id);
                id
            }
        };
        // The state update enforces existence and layer monotonicity; past
        // it, nothing can refuse the proposal. It can only refuse one that
        // reuses a binding, so a refused proposal leaves the store
        // untouched.
        self.store
            .update_entity_state(entity_id, new_state, proposal.layer)?;

        let created_entities = match proposal.to_surfaces.as_slice() {
            [] => Vec::new(),
            [surface] => {
                self.store.append_attribute(entity_id, surface.clone())?;
                Vec::new()
            }
            surfaces => {
                let parent = self
                    .store
                    .get_entity(entity_id)
                    .ok_or(StoreError::EntityNotFound(entity_id))?;
                let mut created = Vec::with_capacity(surfaces.len());
                for surface in surfaces {
                    let successor = self.store.create_entity(
                        surface,
                        parent.attributes.clone(),
                        OntologicalState::Split,
                        proposal.layer,
                    );
                    self.bindings.insert(surface.clone(), successor);
                    created.push(successor);
                }
                created
            }
        };
        let report =
            self.engine
                .propagate(entity_id, new_state, proposal.layer, &created_entities)?;
        log::info!(
            "applied '{}' proposal for '{}' at layer {}: entity {entity_id} now {new_state:?}",
            proposal.kind,
            proposal.identity_key,
            proposal.layer
        );

        let applied = AppliedTransformation {
            proposal,
            entity_id,
            identity,
            created_entities,
            report,
        };
        self.history.push(applied.clone());
        Ok(applied)
    }

    /// Entity currently bound to `key`, if the session has seen it.
    pub fn binding(&self, key: &str) -> Option<EntityId> {
        self.bindings.get(key).copied()
    }

    /// Every proposal applied in this session, oldest first.
    pub fn history(&self) -> &[AppliedTransformation] {
        &self.history
    }

    /// Chain of surfaces `key` has moved through in this session. Empty if
    /// the session has never applied a proposal for `key`.
    pub fn lineage(&self, key: &str) -> IdentityChain {
        IdentityChain::from_history(&self.history, key)
    }

    fn ensure_identity(&self, key: &str) -> EngineResult<IdentityId> {
        if let Some(block) = self.registry.find(key) {
            return Ok(block.id());
        }
        Ok(self.registry.allocate(key)?)
    }
}
