//! Behavior every `StorageBackend` implementation must share

use super::StorageBackend;
use ensemble_coord_core::Error;
use std::sync::Arc;

pub(crate) async fn run_all<B: StorageBackend>(backend: &B) {
    get_put_and_replace(backend).await;
    create_exclusive_rejects_existing(backend).await;
    move_atomic_relocates(backend).await;
    compare_and_delete_checks_content(backend).await;
    list_returns_direct_children(backend).await;
    append_and_read_from_offsets(backend).await;
}

async fn get_put_and_replace<B: StorageBackend>(backend: &B) {
    assert_eq!(backend.get("agents/missing.json").await.unwrap(), None);

    backend.put("agents/a.json", b"one").await.unwrap();
    backend.put("agents/a.json", b"two").await.unwrap();
    assert_eq!(backend.get("agents/a.json").await.unwrap(), Some(b"two".to_vec()));

    assert!(backend.delete("agents/a.json").await.unwrap());
    assert!(!backend.delete("agents/a.json").await.unwrap());
}

async fn create_exclusive_rejects_existing<B: StorageBackend>(backend: &B) {
    assert!(backend.create_exclusive("locks/x.lock", b"first").await.unwrap());
    assert!(!backend.create_exclusive("locks/x.lock", b"second").await.unwrap());
    assert_eq!(backend.get("locks/x.lock").await.unwrap(), Some(b"first".to_vec()));
}

async fn move_atomic_relocates<B: StorageBackend>(backend: &B) {
    backend.put("pending/m.json", b"item").await.unwrap();

    assert!(backend.move_atomic("pending/m.json", "active/m.json").await.unwrap());
    assert_eq!(backend.get("pending/m.json").await.unwrap(), None);
    assert_eq!(backend.get("active/m.json").await.unwrap(), Some(b"item".to_vec()));

    assert!(!backend.move_atomic("pending/m.json", "active/m.json").await.unwrap());

    backend.put("pending/m.json", b"again").await.unwrap();
    let err = backend
        .move_atomic("pending/m.json", "active/m.json")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Storage { .. }));
    assert_eq!(backend.get("active/m.json").await.unwrap(), Some(b"item".to_vec()));
}

async fn compare_and_delete_checks_content<B: StorageBackend>(backend: &B) {
    backend.put("locks/c.lock", b"holder-a").await.unwrap();

    assert!(!backend.compare_and_delete("locks/c.lock", b"holder-b").await.unwrap());
    assert_eq!(backend.get("locks/c.lock").await.unwrap(), Some(b"holder-a".to_vec()));

    assert!(backend.compare_and_delete("locks/c.lock", b"holder-a").await.unwrap());
    assert_eq!(backend.get("locks/c.lock").await.unwrap(), None);
    assert!(!backend.compare_and_delete("locks/c.lock", b"holder-a").await.unwrap());
}

async fn list_returns_direct_children<B: StorageBackend>(backend: &B) {
    backend.put("queue/b.json", b"b").await.unwrap();
    backend.put("queue/a.json", b"a").await.unwrap();
    backend.put("queue_other/z.json", b"z").await.unwrap();

    assert_eq!(
        backend.list("queue").await.unwrap(),
        vec!["queue/a.json".to_string(), "queue/b.json".to_string()]
    );
    assert!(backend.list("nothing_here").await.unwrap().is_empty());
}

async fn append_and_read_from_offsets<B: StorageBackend>(backend: &B) {
    assert!(backend.read_from("events.log", 0).await.unwrap().is_empty());

    backend.append("events.log", b"one\n").await.unwrap();
    backend.append("events.log", b"two\n").await.unwrap();

    assert_eq!(backend.read_from("events.log", 0).await.unwrap(), b"one\ntwo\n".to_vec());
    assert_eq!(backend.read_from("events.log", 4).await.unwrap(), b"two\n".to_vec());
    assert!(backend.read_from("events.log", 100).await.unwrap().is_empty());
}

/// Many concurrent creators on one key: exactly one wins
pub(crate) async fn exclusive_create_under_contention<B: StorageBackend + 'static>(
    backend: Arc<B>,
) {
    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let backend = backend.clone();
            tokio::spawn(async move {
                backend
                    .create_exclusive("locks/hot.lock", format!("holder-{}", i).as_bytes())
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut winners = 0;
    for task in tasks {
        if task.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

/// A live record survives stale compare-and-deletes racing with creators
/// and readers: it is never detached, replaced or briefly missing
pub(crate) async fn stale_compare_never_detaches_live_record<B: StorageBackend + 'static>(
    backend: Arc<B>,
) {
    let key = "locks/held.lock";
    assert!(backend.create_exclusive(key, b"holder").await.unwrap());

    let tasks: Vec<_> = (0..18)
        .map(|i| {
            let backend = backend.clone();
            tokio::spawn(async move {
                for _ in 0..25 {
                    match i % 3 {
                        0 => assert!(!backend.compare_and_delete(key, b"stale-holder").await.unwrap()),
                        1 => assert!(!backend
                            .create_exclusive(key, format!("intruder-{}", i).as_bytes())
                            .await
                            .unwrap()),
                        _ => assert_eq!(backend.get(key).await.unwrap(), Some(b"holder".to_vec())),
                    }
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(backend.get(key).await.unwrap(), Some(b"holder".to_vec()));
}

/// A move racing with a create on its destination never clobbers either
/// record: exactly one of them ends up at the destination
pub(crate) async fn move_never_overwrites_concurrent_create<B: StorageBackend + 'static>(
    backend: Arc<B>,
) {
    for round in 0..40 {
        let from = format!("pending/race-{}.json", round);
        let to = format!("active/race-{}.json", round);
        backend.put(&from, b"moved").await.unwrap();

        let mover = {
            let backend = backend.clone();
            let (from, to) = (from.clone(), to.clone());
            tokio::spawn(async move { backend.move_atomic(&from, &to).await })
        };
        let creator = {
            let backend = backend.clone();
            let to = to.clone();
            tokio::spawn(async move { backend.create_exclusive(&to, b"created").await.unwrap() })
        };
        let moved = mover.await.unwrap();
        let created = creator.await.unwrap();

        if created {
            assert!(matches!(moved, Err(Error::Storage { .. })));
            assert_eq!(backend.get(&to).await.unwrap(), Some(b"created".to_vec()));
            assert_eq!(backend.get(&from).await.unwrap(), Some(b"moved".to_vec()));
        } else {
            assert!(moved.unwrap());
            assert_eq!(backend.get(&to).await.unwrap(), Some(b"moved".to_vec()));
            assert_eq!(backend.get(&from).await.unwrap(), None);
        }
    }
}
