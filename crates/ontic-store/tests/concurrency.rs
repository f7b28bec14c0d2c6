use std::collections::BTreeSet;
use std::thread;

use ontic_store::{EntityStore, OntologicalState};

#[test]
fn parallel_creation_assigns_distinct_ids() {
    let store = EntityStore::new();

    let mut entity_ids = Vec::new();
    let mut reference_ids = Vec::new();
    thread::scope(|scope| {
        let mut handles = Vec::new();
        for worker in 0..8 {
            let store = &store;
            handles.push(scope.spawn(move || {
                let mut created = (Vec::new(), Vec::new());
                for n in 0..16 {
                    created.0.push(store.create_entity(
                        format!("w{worker}-{n}"),
                        Vec::new(),
                        OntologicalState::Defined,
                        0,
                    ));
                    created
                        .1
                        .push(store.create_reference(1, 2, OntologicalState::Defined, 0));
                }
                created
            }));
        }
        for handle in handles {
            let (entities, references) = handle.join().unwrap();
            entity_ids.extend(entities);
            reference_ids.extend(references);
        }
    });

    let distinct_entities: BTreeSet<u64> = entity_ids.iter().copied().collect();
    let distinct_references: BTreeSet<u64> = reference_ids.iter().copied().collect();
    assert_eq!(distinct_entities, (1..=128).collect::<BTreeSet<u64>>());
    assert_eq!(distinct_references, (1..=128).collect::<BTreeSet<u64>>());
    assert_eq!(store.entity_count(), 128);
    assert_eq!(store.reference_count(), 128);

    // Every id resolves to the record that was stored under it.
    for id in entity_ids {
        assert_eq!(store.get_entity(id).unwrap().id, id);
    }
}

#[test]
fn readers_run_alongside_writers() {
    let store = EntityStore::new();
    store.create_entity("seed", Vec::new(), OntologicalState::Defined, 0);

    thread::scope(|scope| {
        for _ in 0..4 {
            let store = &store;
            scope.spawn(move || {
                for n in 0..100 {
                    store.create_entity(
                        format!("e{n}"),
                        Vec::new(),
                        OntologicalState::Defined,
                        0,
                    );
                }
            });
        }
        for _ in 0..4 {
            let store = &store;
            scope.spawn(move || {
                for _ in 0..100 {
                    let snapshot = store.all_entities();
                    assert!(!snapshot.is_empty());
                    // Ids in any snapshot are dense from 1.
                    for (index, entity) in snapshot.iter().enumerate() {
                        assert_eq!(entity.id, index as u64 + 1);
                    }
                }
            });
        }
    });

    assert_eq!(store.entity_count(), 401);
}
