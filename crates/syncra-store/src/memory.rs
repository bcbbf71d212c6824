//! In-process document store implementing the repository traits.
//!
//! Documents are JSON objects grouped by collection; every mutation is a
//! field-level patch applied under a single lock, which is what makes the
//! conditional lease writes atomic. Change feeds are fanned out over bounded
//! mpsc channels after the lock is released.
//!
//! Registry subscriptions deliver configuration changes only: lease mutations
//! (acquire, heartbeat, release) do not produce registry events, mirroring a
//! feed pipeline scoped to config fields. Without that scoping every
//! heartbeat would restart the owner's watchers.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use syncra_core::models::{doc_id, doc_listener_run, path_value};
use syncra_core::{
    defaults, ChangeEvent, ChangeFilter, ChangeStream, DocumentRepository, Error, Lease, Listener,
    ListenerEvent, ListenerEventStream, ListenerRepository, ListenerRun, OperationType, Result,
};

struct DocWatcher {
    collection: String,
    operation_types: Vec<OperationType>,
    filter: ChangeFilter,
    tx: mpsc::Sender<Result<ChangeEvent>>,
}

#[derive(Default)]
struct Inner {
    listeners: HashMap<Uuid, Listener>,
    collections: HashMap<String, BTreeMap<Uuid, Value>>,
    doc_watchers: Vec<DocWatcher>,
    registry_watchers: Vec<mpsc::Sender<Result<ListenerEvent>>>,
}

/// In-process document store with change feeds and conditional updates.
///
/// Cloning is cheap; clones share the same underlying store, so N simulated
/// engine instances can race against one shared `MemoryStore`.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every change-feed subscription on `collection` with an error,
    /// simulating a dropped feed. Consumers observe one `Err` item and then
    /// end of stream.
    pub fn fail_watchers(&self, collection: &str) {
        let failed: Vec<DocWatcher> = {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            let (failed, kept) = inner
                .doc_watchers
                .drain(..)
                .partition(|w| w.collection == collection);
            inner.doc_watchers = kept;
            failed
        };
        for watcher in failed {
            let _ = watcher
                .tx
                .try_send(Err(Error::Subscription("change feed dropped".to_string())));
        }
    }

    /// Number of live change-feed subscriptions on `collection`.
    pub fn watcher_count(&self, collection: &str) -> usize {
        let inner = self.inner.lock().expect("store lock poisoned");
        inner
            .doc_watchers
            .iter()
            .filter(|w| w.collection == collection && !w.tx.is_closed())
            .count()
    }

    fn emit_doc_event(&self, event: ChangeEvent) {
        let recipients: Vec<mpsc::Sender<Result<ChangeEvent>>> = {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            inner.doc_watchers.retain(|w| !w.tx.is_closed());
            inner
                .doc_watchers
                .iter()
                .filter(|w| {
                    w.collection == event.collection
                        && (w.operation_types.is_empty()
                            || w.operation_types.contains(&event.operation_type))
                        && w.filter.matches(&event)
                })
                .map(|w| w.tx.clone())
                .collect()
        };
        trace!(
            collection = %event.collection,
            document_id = %event.document_id,
            recipients = recipients.len(),
            "emitting change event"
        );
        for tx in recipients {
            // A full queue is a feed gap; reconciliation covers it.
            let _ = tx.try_send(Ok(event.clone()));
        }
    }

    fn emit_registry_event(&self, event: ListenerEvent) {
        let recipients: Vec<mpsc::Sender<Result<ListenerEvent>>> = {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            inner.registry_watchers.retain(|tx| !tx.is_closed());
            inner.registry_watchers.clone()
        };
        for tx in recipients {
            let _ = tx.try_send(Ok(event.clone()));
        }
    }
}

/// Set a dotted path inside a JSON object, creating intermediate objects.
fn set_path(doc: &mut Value, path: &str, value: Value) {
    let mut current = doc;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let map = current.as_object_mut().expect("object just ensured");
        if i == segments.len() - 1 {
            map.insert(segment.to_string(), value);
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

#[async_trait]
impl ListenerRepository for MemoryStore {
    async fn get(&self, id: Uuid) -> Result<Option<Listener>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner.listeners.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Listener>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner.listeners.values().cloned().collect())
    }

    async fn create(&self, listener: Listener) -> Result<()> {
        listener.validate()?;
        {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            inner.listeners.insert(listener.id, listener.clone());
        }
        self.emit_registry_event(ListenerEvent::Created(listener));
        Ok(())
    }

    async fn update(&self, listener: Listener) -> Result<()> {
        listener.validate()?;
        let updated = {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            let Some(existing) = inner.listeners.get(&listener.id) else {
                return Err(Error::ListenerNotFound(listener.id));
            };
            // Config updates never touch lease ownership.
            let mut updated = listener;
            updated.lease = existing.lease.clone();
            inner.listeners.insert(updated.id, updated.clone());
            updated
        };
        self.emit_registry_event(ListenerEvent::Updated(updated));
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let removed = {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            inner.listeners.remove(&id).is_some()
        };
        if removed {
            self.emit_registry_event(ListenerEvent::Deleted(id));
        }
        Ok(())
    }

    async fn list_claimable(
        &self,
        owner_id: &str,
        stale_after: Duration,
    ) -> Result<Vec<Listener>> {
        let now = Utc::now();
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner
            .listeners
            .values()
            .filter(|l| l.is_active)
            .filter(|l| match &l.lease {
                None => true,
                Some(lease) => lease.is_stale(now, stale_after) && !lease.is_held_by(owner_id),
            })
            .cloned()
            .collect())
    }

    async fn acquire_lease(
        &self,
        listener_id: Uuid,
        owner_id: &str,
        stale_after: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let Some(listener) = inner.listeners.get_mut(&listener_id) else {
            return Ok(false);
        };
        if !listener.is_active {
            return Ok(false);
        }
        let claimable = match &listener.lease {
            None => true,
            Some(lease) => lease.is_held_by(owner_id) || lease.is_stale(now, stale_after),
        };
        if claimable {
            listener.lease = Some(Lease {
                owner_id: owner_id.to_string(),
                last_heartbeat: now,
            });
        }
        Ok(claimable)
    }

    async fn release_lease(&self, listener_id: Uuid, owner_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if let Some(listener) = inner.listeners.get_mut(&listener_id) {
            if listener
                .lease
                .as_ref()
                .is_some_and(|l| l.is_held_by(owner_id))
            {
                listener.lease = None;
            }
        }
        Ok(())
    }

    async fn heartbeat(&self, owner_id: &str) -> Result<u64> {
        let now = Utc::now();
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let mut refreshed = 0;
        for listener in inner.listeners.values_mut() {
            if let Some(lease) = listener.lease.as_mut() {
                if lease.is_held_by(owner_id) {
                    lease.last_heartbeat = now;
                    refreshed += 1;
                }
            }
        }
        Ok(refreshed)
    }

    async fn watch_registry(&self) -> Result<ListenerEventStream> {
        let (tx, rx) = mpsc::channel(defaults::EVENT_QUEUE_CAPACITY);
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.registry_watchers.push(tx);
        Ok(ListenerEventStream::new(rx))
    }
}

#[async_trait]
impl DocumentRepository for MemoryStore {
    async fn get(&self, collection: &str, id: Uuid) -> Result<Option<Value>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner
            .collections
            .get(collection)
            .and_then(|c| c.get(&id))
            .cloned())
    }

    async fn insert(&self, collection: &str, mut doc: Value) -> Result<Uuid> {
        if !doc.is_object() {
            return Err(Error::Store("documents must be JSON objects".to_string()));
        }
        let id = doc_id(&doc).unwrap_or_else(Uuid::new_v4);
        set_path(&mut doc, "_id", Value::String(id.to_string()));
        {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            inner
                .collections
                .entry(collection.to_string())
                .or_default()
                .insert(id, doc.clone());
        }
        self.emit_doc_event(ChangeEvent {
            operation_type: OperationType::Insert,
            collection: collection.to_string(),
            document_id: id,
            full_document: Some(doc),
            updated_fields: vec![],
        });
        Ok(id)
    }

    async fn apply_patch(
        &self,
        collection: &str,
        id: Uuid,
        patch: Map<String, Value>,
    ) -> Result<Option<Value>> {
        let updated = {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            let Some(doc) = inner
                .collections
                .get_mut(collection)
                .and_then(|c| c.get_mut(&id))
            else {
                return Ok(None);
            };
            for (path, value) in &patch {
                set_path(doc, path, value.clone());
            }
            doc.clone()
        };
        self.emit_doc_event(ChangeEvent {
            operation_type: OperationType::Update,
            collection: collection.to_string(),
            document_id: id,
            full_document: Some(updated.clone()),
            updated_fields: patch.keys().cloned().collect(),
        });
        Ok(Some(updated))
    }

    async fn init_listener_map(&self, collection: &str, id: Uuid) -> Result<()> {
        let initialized = {
            let mut inner = self.inner.lock().expect("store lock poisoned");
            let Some(doc) = inner
                .collections
                .get_mut(collection)
                .and_then(|c| c.get_mut(&id))
            else {
                return Ok(());
            };
            // Guarded: only write when absent or null, so a concurrently
            // initialized map with sibling entries is never clobbered.
            match path_value(doc, "metadata.listeners") {
                Some(v) if !v.is_null() => false,
                _ => {
                    set_path(doc, "metadata.listeners", Value::Object(Map::new()));
                    true
                }
            }
        };
        if initialized {
            self.emit_doc_event(ChangeEvent {
                operation_type: OperationType::Update,
                collection: collection.to_string(),
                document_id: id,
                full_document: DocumentRepository::get(self, collection, id).await?,
                updated_fields: vec!["metadata.listeners".to_string()],
            });
        }
        Ok(())
    }

    async fn set_listener_run(
        &self,
        collection: &str,
        id: Uuid,
        listener_id: Uuid,
        run: &ListenerRun,
    ) -> Result<Option<Value>> {
        let fields = serde_json::to_value(run)?
            .as_object()
            .cloned()
            .unwrap_or_default();
        let mut patch = Map::new();
        for (key, value) in fields {
            patch.insert(
                format!("metadata.listeners.{listener_id}.{key}"),
                value,
            );
        }
        self.apply_patch(collection, id, patch).await
    }

    async fn find_pending(&self, collection: &str, listener_id: Uuid) -> Result<Vec<Value>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner
            .collections
            .get(collection)
            .map(|docs| {
                docs.values()
                    .filter(|doc| {
                        !doc_listener_run(doc, listener_id).is_some_and(|r| r.is_complete())
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn watch(
        &self,
        collection: &str,
        operation_types: &[OperationType],
        filter: &ChangeFilter,
    ) -> Result<ChangeStream> {
        let (tx, rx) = mpsc::channel(defaults::EVENT_QUEUE_CAPACITY);
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.doc_watchers.push(DocWatcher {
            collection: collection.to_string(),
            operation_types: operation_types.to_vec(),
            filter: filter.clone(),
            tx,
        });
        Ok(ChangeStream::new(rx))
    }
}
