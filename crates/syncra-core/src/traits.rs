//! Repository and scheduler traits implemented by store adapters.
//!
//! The engine never talks to a database driver directly; it sees the document
//! store through [`ListenerRepository`] and [`DocumentRepository`], and the
//! external job scheduler through [`JobScheduler`]. All lease writes are
//! conditional updates performed inside the store adapter; in-memory
//! coordination is never relied on for ownership.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{ChangeEvent, ChangeFilter, Listener, ListenerEvent, ListenerRun, OperationType};

/// A change-feed subscription on one collection.
///
/// Yields `Err` when the underlying feed drops, after which no further events
/// arrive and the consumer is expected to release its lease and re-subscribe.
/// Dropping or closing the stream ends the subscription.
pub struct ChangeStream {
    rx: mpsc::Receiver<Result<ChangeEvent>>,
}

impl ChangeStream {
    pub fn new(rx: mpsc::Receiver<Result<ChangeEvent>>) -> Self {
        Self { rx }
    }

    /// Receive the next event; `None` once the feed is closed.
    pub async fn recv(&mut self) -> Option<Result<ChangeEvent>> {
        self.rx.recv().await
    }

    /// Close the subscription explicitly.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// A subscription to changes on the listener registry itself.
pub struct ListenerEventStream {
    rx: mpsc::Receiver<Result<ListenerEvent>>,
}

impl ListenerEventStream {
    pub fn new(rx: mpsc::Receiver<Result<ListenerEvent>>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<Result<ListenerEvent>> {
        self.rx.recv().await
    }

    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Access to listener records and their lease metadata.
#[async_trait]
pub trait ListenerRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Listener>>;

    async fn list(&self) -> Result<Vec<Listener>>;

    /// Register a listener. Fails fast on contract violations
    /// ([`Listener::validate`]).
    async fn create(&self, listener: Listener) -> Result<()>;

    /// Replace a listener's configuration. Lease fields are preserved.
    async fn update(&self, listener: Listener) -> Result<()>;

    async fn delete(&self, id: Uuid) -> Result<()>;

    /// Active listeners that are unowned or hold a stale lease, excluding
    /// ones already leased by `owner_id`.
    async fn list_claimable(&self, owner_id: &str, stale_after: Duration)
        -> Result<Vec<Listener>>;

    /// Conditional lease claim: succeeds only if the lease is absent, already
    /// held by `owner_id`, or stale. On success sets
    /// `{ownerId, lastHeartbeat: now}`. Returns whether the caller now owns
    /// the lease. Contention is an expected outcome, not an error.
    async fn acquire_lease(
        &self,
        listener_id: Uuid,
        owner_id: &str,
        stale_after: Duration,
    ) -> Result<bool>;

    /// Clear the lease only if still held by `owner_id`; idempotent no-op
    /// otherwise.
    async fn release_lease(&self, listener_id: Uuid, owner_id: &str) -> Result<()>;

    /// Refresh `lastHeartbeat` in bulk for every listener leased by
    /// `owner_id`. Returns the number of leases refreshed.
    async fn heartbeat(&self, owner_id: &str) -> Result<u64>;

    /// Subscribe to create/update/delete events on the registry.
    async fn watch_registry(&self) -> Result<ListenerEventStream>;
}

/// Access to target documents in watched collections.
///
/// All mutations are field-level patches, never whole-document overwrites, so
/// concurrent listeners touching the same document cannot clobber each
/// other's entries.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    async fn get(&self, collection: &str, id: Uuid) -> Result<Option<Value>>;

    /// Insert a document, assigning an internal `_id` if absent. Returns the
    /// internal identifier.
    async fn insert(&self, collection: &str, doc: Value) -> Result<Uuid>;

    /// Apply a dotted-path field patch to one document. Returns the updated
    /// document, or `None` if it does not exist.
    async fn apply_patch(
        &self,
        collection: &str,
        id: Uuid,
        patch: Map<String, Value>,
    ) -> Result<Option<Value>>;

    /// Guarded initialization of `metadata.listeners` to an empty map, only
    /// when the field is absent or null. Never clobbers a map concurrently
    /// initialized by a sibling listener.
    async fn init_listener_map(&self, collection: &str, id: Uuid) -> Result<()>;

    /// Merge the non-`None` fields of `run` into
    /// `metadata.listeners.<listener_id>`. Returns the updated document, or
    /// `None` if it does not exist.
    async fn set_listener_run(
        &self,
        collection: &str,
        id: Uuid,
        listener_id: Uuid,
        run: &ListenerRun,
    ) -> Result<Option<Value>>;

    /// Documents in `collection` whose entry for `listener_id` is absent or
    /// not complete. This is the reconciliation backstop query.
    async fn find_pending(&self, collection: &str, listener_id: Uuid) -> Result<Vec<Value>>;

    /// Subscribe to a change feed on `collection`, scoped by operation types
    /// and filter predicate.
    async fn watch(
        &self,
        collection: &str,
        operation_types: &[OperationType],
        filter: &ChangeFilter,
    ) -> Result<ChangeStream>;
}

/// The external background-job scheduler.
///
/// Fire-and-forget from this subsystem's perspective: execution semantics
/// (retries, concurrency caps) belong to the scheduler.
#[async_trait]
pub trait JobScheduler: Send + Sync {
    /// Submit a job and return the scheduler-assigned job id.
    async fn submit(&self, job_name: &str, payload: Value) -> Result<Uuid>;
}
