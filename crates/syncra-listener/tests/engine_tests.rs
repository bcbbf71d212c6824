//! Cross-component tests running full engine instances against the
//! in-memory store: single ownership under contention, end-to-end dispatch,
//! reconciliation of writes that bypassed the change feed, crash takeover,
//! and graceful handoff on shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use syncra_core::models::{doc_listener_run, ChangeFilter, ListenerMetadata};
use syncra_core::{
    DocumentRepository, Listener, ListenerConfig, ListenerRepository, OperationType,
};
use syncra_listener::ListenerEngine;
use syncra_store::{MemoryStore, RecordingScheduler};

fn fast_config() -> ListenerConfig {
    ListenerConfig::default()
        .with_heartbeat_interval(Duration::from_millis(20))
        .with_stale_threshold(Duration::from_millis(100))
        .with_acquire_interval(Duration::from_millis(20))
        .with_reconcile_interval(Duration::from_millis(30))
        .with_watch_backoff(Duration::from_millis(10))
}

fn start_engine(
    store: &MemoryStore,
    scheduler: &RecordingScheduler,
) -> syncra_listener::EngineHandle {
    ListenerEngine::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(scheduler.clone()),
        fast_config(),
    )
    .expect("engine config is valid")
    .start()
}

fn widget_listener() -> Listener {
    Listener {
        id: Uuid::new_v4(),
        collection: "widgets".to_string(),
        operation_types: vec![OperationType::Insert, OperationType::Update],
        filter: ChangeFilter::default(),
        job_name: "widget-sync".to_string(),
        is_active: true,
        metadata: ListenerMetadata {
            workspace_id: "ws-1".to_string(),
            object_type: Some("widget".to_string()),
            ..Default::default()
        },
        lease: None,
    }
}

/// Poll `check` every 10ms until it passes or two seconds elapse.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_single_owner_across_racing_instances() {
    let store = MemoryStore::new();
    let scheduler = RecordingScheduler::new();
    let listener = widget_listener();
    store.create(listener.clone()).await.unwrap();

    let handles = vec![
        start_engine(&store, &scheduler),
        start_engine(&store, &scheduler),
        start_engine(&store, &scheduler),
    ];

    assert!(
        eventually(|| async {
            handles
                .iter()
                .any(|h| h.active_listeners().contains(&listener.id))
        })
        .await,
        "some instance must claim the listener"
    );
    // Let the pollers race a while longer; ownership must stay unique.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let owners: Vec<_> = handles
        .iter()
        .filter(|h| h.active_listeners().contains(&listener.id))
        .collect();
    assert_eq!(owners.len(), 1, "exactly one instance may own the listener");

    let stored = ListenerRepository::get(&store, listener.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.lease.unwrap().owner_id, owners[0].owner_id());
    assert_eq!(store.watcher_count("widgets"), 1);

    for handle in &handles {
        handle.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_insert_dispatches_exactly_one_job() {
    let store = MemoryStore::new();
    let scheduler = RecordingScheduler::new();
    let listener = widget_listener();
    store.create(listener.clone()).await.unwrap();

    let handle = start_engine(&store, &scheduler);
    assert!(
        eventually(|| async { handle.active_listeners().contains(&listener.id) }).await,
        "engine must claim the listener"
    );

    let doc_id = store
        .insert(
            "widgets",
            json!({"name": "anvil", "metadata": {"objectType": "widget"}}),
        )
        .await
        .unwrap();

    assert!(
        eventually(|| async {
            let doc = DocumentRepository::get(&store, "widgets", doc_id)
                .await
                .unwrap()
                .unwrap();
            doc_listener_run(&doc, listener.id).is_some_and(|run| run.is_complete())
        })
        .await,
        "document must reach complete status"
    );

    // Follow-up update of an already-complete document must not re-dispatch.
    let mut patch = serde_json::Map::new();
    patch.insert("name".to_string(), json!("anvil mk2"));
    store.apply_patch("widgets", doc_id, patch).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let jobs = scheduler.submitted_named("widget-sync");
    assert_eq!(jobs.len(), 1, "exactly one job per document per listener");
    assert_eq!(jobs[0].payload["objectId"], json!(doc_id.to_string()));
    assert_eq!(jobs[0].payload["workspaceId"], json!("ws-1"));
    assert_eq!(jobs[0].payload["collection"], json!("widgets"));

    let doc = DocumentRepository::get(&store, "widgets", doc_id)
        .await
        .unwrap()
        .unwrap();
    let run = doc_listener_run(&doc, listener.id).unwrap();
    assert_eq!(run.job_id, Some(jobs[0].job_id));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_mismatched_object_type_is_never_dispatched() {
    let store = MemoryStore::new();
    let scheduler = RecordingScheduler::new();
    let listener = widget_listener();
    store.create(listener.clone()).await.unwrap();

    let handle = start_engine(&store, &scheduler);
    assert!(eventually(|| async { handle.active_listeners().contains(&listener.id) }).await);

    store
        .insert("widgets", json!({"metadata": {"objectType": "gadget"}}))
        .await
        .unwrap();
    // Long enough for the live event and several reconcile passes.
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(scheduler.submitted().is_empty());
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reconciliation_converges_documents_written_behind_the_feed() {
    let store = MemoryStore::new();
    let scheduler = RecordingScheduler::new();
    let listener = widget_listener();
    store.create(listener.clone()).await.unwrap();

    // Written before any engine exists, so no change feed ever saw it.
    let doc_id = store
        .insert("widgets", json!({"metadata": {"objectType": "widget"}}))
        .await
        .unwrap();

    let handle = start_engine(&store, &scheduler);
    assert!(
        eventually(|| async {
            let doc = DocumentRepository::get(&store, "widgets", doc_id)
                .await
                .unwrap()
                .unwrap();
            doc_listener_run(&doc, listener.id).is_some_and(|run| run.is_complete())
        })
        .await,
        "reconciliation must drive the missed document to complete"
    );
    assert_eq!(scheduler.submitted_named("widget-sync").len(), 1);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stale_lease_of_crashed_instance_is_taken_over() {
    let store = MemoryStore::new();
    let scheduler = RecordingScheduler::new();
    let listener = widget_listener();
    store.create(listener.clone()).await.unwrap();

    // A dead instance holds the lease and will never heartbeat again.
    assert!(store
        .acquire_lease(listener.id, "dead-instance", Duration::from_millis(100))
        .await
        .unwrap());

    let handle = start_engine(&store, &scheduler);
    assert!(
        eventually(|| async { handle.active_listeners().contains(&listener.id) }).await,
        "lease must be reclaimed once stale"
    );
    let stored = ListenerRepository::get(&store, listener.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.lease.unwrap().owner_id, handle.owner_id());

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_hands_listener_to_surviving_instance() {
    let store = MemoryStore::new();
    let scheduler = RecordingScheduler::new();
    let listener = widget_listener();
    store.create(listener.clone()).await.unwrap();

    let first = start_engine(&store, &scheduler);
    assert!(eventually(|| async { first.active_listeners().contains(&listener.id) }).await);

    let second = start_engine(&store, &scheduler);
    first.shutdown().await.unwrap();

    // The release is immediate, so the takeover needs only an acquisition
    // poll, not the staleness window.
    assert!(
        eventually(|| async { second.active_listeners().contains(&listener.id) }).await,
        "surviving instance must pick up the released lease"
    );
    let stored = ListenerRepository::get(&store, listener.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.lease.unwrap().owner_id, second.owner_id());

    second.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_registry_driven_lifecycle_create_update_delete() {
    let store = MemoryStore::new();
    let scheduler = RecordingScheduler::new();
    let handle = start_engine(&store, &scheduler);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Created after startup; claimed via the registry feed.
    let listener = widget_listener();
    store.create(listener.clone()).await.unwrap();
    assert!(eventually(|| async { handle.active_listeners().contains(&listener.id) }).await);

    // Deactivation stops the watcher and frees the lease.
    let mut updated = listener.clone();
    updated.is_active = false;
    store.update(updated.clone()).await.unwrap();
    assert!(
        eventually(|| async { !handle.active_listeners().contains(&listener.id) }).await,
        "deactivated listener must lose its watcher"
    );
    assert!(
        eventually(|| async {
            ListenerRepository::get(&store, listener.id)
                .await
                .unwrap()
                .unwrap()
                .lease
                .is_none()
        })
        .await,
        "deactivated listener must have no lease"
    );

    // Reactivation brings it back, then deletion tears it down for good.
    updated.is_active = true;
    store.update(updated).await.unwrap();
    assert!(eventually(|| async { handle.active_listeners().contains(&listener.id) }).await);

    store.delete(listener.id).await.unwrap();
    assert!(eventually(|| async { !handle.active_listeners().contains(&listener.id) }).await);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_watcher_survives_feed_drop() {
    let store = MemoryStore::new();
    let scheduler = RecordingScheduler::new();
    let listener = widget_listener();
    store.create(listener.clone()).await.unwrap();

    let handle = start_engine(&store, &scheduler);
    assert!(eventually(|| async { handle.active_listeners().contains(&listener.id) }).await);

    store.fail_watchers("widgets");
    // The watcher backs off, re-acquires, and resubscribes; events flow again.
    assert!(
        eventually(|| async { store.watcher_count("widgets") == 1 }).await,
        "subscription must come back after a feed drop"
    );

    let doc_id = store
        .insert("widgets", json!({"metadata": {"objectType": "widget"}}))
        .await
        .unwrap();
    assert!(
        eventually(|| async {
            let doc = DocumentRepository::get(&store, "widgets", doc_id)
                .await
                .unwrap()
                .unwrap();
            doc_listener_run(&doc, listener.id).is_some_and(|run| run.is_complete())
        })
        .await,
        "events after the restart must still be processed"
    );

    handle.shutdown().await.unwrap();
}
