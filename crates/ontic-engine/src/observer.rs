use std::fmt;

use serde::{Deserialize, Serialize};

use ontic_store::{Entity, EntityId};

/// A named perspective on entities.
///
/// The perspective decides, per entity, what this observer perceives it
/// as; `None` means the entity does not exist for this observer at all.
pub struct Observer {
    name: String,
    perspective: Box<dyn Fn(&Entity) -> Option<String> + Send + Sync>,
}

impl Observer {
    pub fn new(
        name: impl Into<String>,
        perspective: impl Fn(&Entity) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Observer {
            name: name.into(),
            perspective: Box::new(perspective),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interpret(&self, entity: &Entity) -> Option<String> {
        (self.perspective)(entity)
    }
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// One cell of the observer/entity matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interpretation {
    pub observer: String,
    pub entity_id: EntityId,
    /// `None` when the observer does not perceive the entity.
    pub view: Option<String>,
}

/// Runs every observer over every entity. Rows are grouped by observer,
/// entities in the order given.
pub fn interpret_all(observers: &[Observer], entities: &[Entity]) -> Vec<Interpretation> {
    let mut matrix = Vec::with_capacity(observers.len() * entities.len());
    for observer in observers {
        for entity in entities {
            matrix.push(Interpretation {
                observer: observer.name.clone(),
                entity_id: entity.id,
                view: observer.interpret(entity),
            });
        }
    }
    matrix
}
