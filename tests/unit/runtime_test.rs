//! Tests for tokio spawner utilities

use render_farm::runtime::{tokio_spawner::TokioSpawner, Spawn};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tokio_spawner_spawn() {
    let spawner = TokioSpawner::new(tokio::runtime::Handle::current());

    let (tx, rx) = tokio::sync::oneshot::channel();
    spawner.spawn(async move {
        tx.send(123).unwrap();
    });

    let result = rx.await.expect("oneshot result");
    assert_eq!(result, 123);
}

#[tokio::test]
async fn test_current_spawner() {
    let spawner = TokioSpawner::current();
    let (tx, rx) = tokio::sync::oneshot::channel();
    spawner.spawn(async move {
        tx.send("done").unwrap();
    });
    assert_eq!(rx.await.unwrap(), "done");
}
