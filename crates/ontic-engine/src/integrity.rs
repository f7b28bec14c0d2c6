use std::collections::{BTreeMap, BTreeSet};
use std::thread;

use serde::{Deserialize, Serialize};

use ontic_store::{
    EntityId, EntityStore, IntegrityStatus, Layer, OntologicalState, Reference, ReferenceId,
    Revalidation,
};

use crate::{EngineError, EngineResult};

/// Successor sets for currently split entities, keyed by the split entity.
pub type SplitMap = BTreeMap<EntityId, Vec<EntityId>>;

/// Derives a reference's status from its target's new state and the state
/// the target had when the reference was made.
///
/// Split targets yield `Unresolved` (never `IdentitySplit`, which stays
/// reserved); merged targets `IdentityMerged`; observer-relative targets
/// `ObserverRelative`; collapsed targets `Invalidated`. Any other state
/// that differs from the creation-time snapshot is `IdentityChanged`, and
/// a state equal to the snapshot is `Valid` again, even if the reference
/// had drifted through another status in between.
pub fn classify(
    new_state: OntologicalState,
    state_at_creation: OntologicalState,
) -> IntegrityStatus {
    match new_state {
        OntologicalState::Split => IntegrityStatus::Unresolved,
        OntologicalState::Merged => IntegrityStatus::IdentityMerged,
        OntologicalState::ObserverRelative => IntegrityStatus::ObserverRelative,
        OntologicalState::Collapsed => IntegrityStatus::Invalidated,
        state if state != state_at_creation => IntegrityStatus::IdentityChanged,
        _ => IntegrityStatus::Valid,
    }
}

/// What one propagation sweep touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagationReport {
    pub entity_id: EntityId,
    pub new_state: OntologicalState,
    pub new_layer: Layer,
    /// References reclassified by the sweep, in store order.
    pub references: Vec<ReferenceId>,
}

/// Stateless policy evaluator over a borrowed store.
#[derive(Debug, Clone, Copy)]
pub struct IntegrityEngine<'a> {
    store: &'a EntityStore,
}

impl<'a> IntegrityEngine<'a> {
    pub fn new(store: &'a EntityStore) -> Self {
        IntegrityEngine { store }
    }

    /// Reclassifies every reference targeting `entity_id` after the entity
    /// moved to `new_state` at `new_layer`.
    ///
    /// `split_targets` names the successors of a `Split` transition and
    /// must be non-empty for one; it is ignored for every other state. Each
    /// reference is decided locally from `new_state` alone and stamped with
    /// `new_layer` whatever the outcome, so repeating a sweep with the same
    /// arguments is a no-op. The entity itself does not have to exist in
    /// the store; references to a never-created or foreign id are swept the
    /// same way.
    pub fn propagate(
        &self,
        entity_id: EntityId,
        new_state: OntologicalState,
        new_layer: Layer,
        split_targets: &[EntityId],
    ) -> EngineResult<PropagationReport> {
        if new_state == OntologicalState::Split && split_targets.is_empty() {
            return Err(EngineError::InvalidSplitTransition { entity: entity_id });
        }
        let candidates: BTreeSet<EntityId> = split_targets.iter().copied().collect();
        let mut references = Vec::new();
        for reference in self.store.references_targeting(entity_id) {
            let status = classify(new_state, reference.target_state_at_creation);
            let candidate_targets = if status == IntegrityStatus::Unresolved {
                candidates.clone()
            } else {
                BTreeSet::new()
            };
            self.store.apply_revalidation(
                reference.id,
                Revalidation {
                    status,
                    candidate_targets,
                    layer: Some(new_layer),
                },
            )?;
            references.push(reference.id);
        }
        log::debug!(
            "propagated {new_state:?} at layer {new_layer}: {} references of entity {entity_id}",
            references.len()
        );
        Ok(PropagationReport {
            entity_id,
            new_state,
            new_layer,
            references,
        })
    }

    /// Revalidates every reference in the store against its target's
    /// current state and returns how many were checked.
    ///
    /// A reference whose target has no entity record is `Invalidated` and
    /// keeps its previous validation stamp; a present target reclassifies
    /// the reference and stamps the target's temporal layer. Split targets
    /// take their candidates from `split_map`; a split entity with no
    /// non-empty entry there fails the audit before anything is applied.
    pub fn revalidate_all(&self, split_map: &SplitMap) -> EngineResult<usize> {
        let references = self.store.all_references();
        let mut planned = Vec::with_capacity(references.len());
        for reference in &references {
            planned.push((reference.id, plan(self.store, reference, split_map)?));
        }
        for (id, outcome) in planned {
            self.store.apply_revalidation(id, outcome)?;
        }
        log::debug!("revalidated {} references", references.len());
        Ok(references.len())
    }

    /// `revalidate_all` over worker threads.
    ///
    /// The reference snapshot is split into chunks, one scoped thread per
    /// chunk, at most `max_threads` of them. Per-reference outcomes match
    /// the sequential audit; on error the first failing chunk's error is
    /// returned and revalidations other chunks already applied stay
    /// applied. With one thread this is exactly [`Self::revalidate_all`].
    pub fn revalidate_all_parallel(
        &self,
        split_map: &SplitMap,
        max_threads: usize,
    ) -> EngineResult<usize> {
        let references = self.store.all_references();
        let thread_count = max_threads.max(1).min(references.len().max(1));
        if thread_count == 1 {
            return self.revalidate_all(split_map);
        }

        let per_thread = references.len().div_ceil(thread_count);
        let mut outcomes = Vec::new();
        thread::scope(|scope| {
            let mut workers = Vec::new();
            for chunk in references.chunks(per_thread) {
                let store = self.store;
                workers.push(scope.spawn(move || revalidate_chunk(store, chunk, split_map)));
            }
            for worker in workers {
                outcomes.push(worker.join().expect("revalidation worker panicked"));
            }
        });
        for outcome in outcomes {
            outcome?;
        }
        log::debug!(
            "revalidated {} references across {thread_count} threads",
            references.len()
        );
        Ok(references.len())
    }
}

fn revalidate_chunk(
    store: &EntityStore,
    chunk: &[Reference],
    split_map: &SplitMap,
) -> EngineResult<()> {
    for reference in chunk {
        let outcome = plan(store, reference, split_map)?;
        store.apply_revalidation(reference.id, outcome)?;
    }
    Ok(())
}

fn plan(
    store: &EntityStore,
    reference: &Reference,
    split_map: &SplitMap,
) -> EngineResult<Revalidation> {
    let Some(target) = store.get_entity(reference.target_entity_id) else {
        // Dangling target: the reference outlived, or preceded, its entity.
        return Ok(Revalidation {
            status: IntegrityStatus::Invalidated,
            candidate_targets: BTreeSet::new(),
            layer: None,
        });
    };
    let status = classify(target.state, reference.target_state_at_creation);
    let candidate_targets = if status == IntegrityStatus::Unresolved {
        let successors = split_map.get(&target.id).map(Vec::as_slice).unwrap_or(&[]);
        if successors.is_empty() {
            return Err(EngineError::InvalidSplitTransition { entity: target.id });
        }
        successors.iter().copied().collect()
    } else {
        BTreeSet::new()
    };
    Ok(Revalidation {
        status,
        candidate_targets,
        layer: Some(target.temporal_layer),
    })
}
