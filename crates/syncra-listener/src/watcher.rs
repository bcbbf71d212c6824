//! Change-feed watchers, one per owned listener.
//!
//! A [`WatcherSet`] is the process-wide registry of active subscriptions:
//! an owned, mutex-guarded map constructed once and shared by `Arc`, never a
//! global. Each entry is a spawned task holding one change-feed subscription
//! and forwarding events to the processor pool over the engine's channel.
//!
//! Watcher state machine: starting -> active -> (error -> backoff ->
//! re-acquire -> starting) | closed. On a dropped feed the task releases its
//! lease first, so another instance can take over if this one fails to
//! re-acquire after the backoff.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use syncra_core::Listener;

use crate::engine::{EngineContext, EngineEvent};
use crate::processor::ProcessRequest;

struct WatcherHandle {
    cancel: CancellationToken,
    generation: u64,
}

/// Registry of active change-feed subscriptions, keyed by listener id.
///
/// Only one active subscription exists per listener within a process;
/// starting a watcher for an id stops any previous one first. Registrations
/// carry a generation counter so a finishing task never removes the entry of
/// a watcher that replaced it.
#[derive(Default)]
pub struct WatcherSet {
    inner: Mutex<HashMap<Uuid, WatcherHandle>>,
    generations: AtomicU64,
}

impl WatcherSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a watcher is registered for this listener.
    pub fn contains(&self, listener_id: Uuid) -> bool {
        self.inner
            .lock()
            .expect("watcher set lock poisoned")
            .contains_key(&listener_id)
    }

    /// Listener ids with an active watcher in this process.
    pub fn active_ids(&self) -> Vec<Uuid> {
        self.inner
            .lock()
            .expect("watcher set lock poisoned")
            .keys()
            .copied()
            .collect()
    }

    /// Stop the watcher for a listener: the task closes its subscription.
    /// The lease is left alone; callers decide whether to release it (a
    /// config-change restart keeps it, a delete or shutdown releases it).
    /// No-op if none is registered.
    pub fn stop(&self, listener_id: Uuid) {
        let handle = self
            .inner
            .lock()
            .expect("watcher set lock poisoned")
            .remove(&listener_id);
        if let Some(handle) = handle {
            debug!(%listener_id, "stopping watcher");
            handle.cancel.cancel();
        }
    }

    /// Stop every watcher.
    pub fn stop_all(&self) {
        let handles: Vec<(Uuid, WatcherHandle)> = self
            .inner
            .lock()
            .expect("watcher set lock poisoned")
            .drain()
            .collect();
        for (listener_id, handle) in handles {
            debug!(%listener_id, "stopping watcher");
            handle.cancel.cancel();
        }
    }

    fn remove_generation(&self, listener_id: Uuid, generation: u64) {
        let mut inner = self.inner.lock().expect("watcher set lock poisoned");
        if inner
            .get(&listener_id)
            .is_some_and(|h| h.generation == generation)
        {
            inner.remove(&listener_id);
        }
    }
}

/// Start watching a listener. Requires a live lease already held by this
/// instance, acquired immediately before calling.
pub(crate) fn start_watcher(
    ctx: &Arc<EngineContext>,
    set: &Arc<WatcherSet>,
    listener: Listener,
    tx: mpsc::Sender<ProcessRequest>,
) {
    let listener_id = listener.id;

    // Re-registering must close any existing subscription for this id before
    // opening a new one.
    set.stop(listener_id);

    let cancel = ctx.cancel.child_token();
    let generation = set.generations.fetch_add(1, Ordering::Relaxed);
    set.inner
        .lock()
        .expect("watcher set lock poisoned")
        .insert(
            listener_id,
            WatcherHandle {
                cancel: cancel.clone(),
                generation,
            },
        );

    let ctx = ctx.clone();
    let set = set.clone();
    tokio::spawn(async move {
        run_watcher(ctx, set, listener, tx, cancel, generation).await;
    });
}

async fn run_watcher(
    ctx: Arc<EngineContext>,
    set: Arc<WatcherSet>,
    listener: Listener,
    tx: mpsc::Sender<ProcessRequest>,
    cancel: CancellationToken,
    generation: u64,
) {
    let listener_id = listener.id;
    loop {
        let mut stream = match ctx
            .documents
            .watch(
                &listener.collection,
                &listener.operation_types,
                &listener.filter,
            )
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%listener_id, collection = %listener.collection, error = %e, "subscription failed");
                ctx.locks.release(listener_id).await;
                set.remove_generation(listener_id, generation);
                return;
            }
        };

        info!(%listener_id, collection = %listener.collection, "watcher active");
        ctx.emit(EngineEvent::WatcherStarted { listener_id });

        let dropped = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    stream.close();
                    debug!(%listener_id, "watcher closed");
                    ctx.emit(EngineEvent::WatcherStopped { listener_id });
                    return;
                }
                item = stream.recv() => match item {
                    Some(Ok(event)) => {
                        let request = ProcessRequest {
                            listener: listener.clone(),
                            event,
                        };
                        if tx.send(request).await.is_err() {
                            // Processor pool is gone; the engine is stopping
                            // and will release held leases itself.
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(%listener_id, error = %e, "change feed dropped");
                        break true;
                    }
                    None => break true,
                }
            }
        };

        if dropped {
            // Release before backing off so another instance can take over
            // while this one waits.
            ctx.locks.release(listener_id).await;
            ctx.emit(EngineEvent::WatcherErrored { listener_id });

            tokio::select! {
                _ = cancel.cancelled() => {
                    set.remove_generation(listener_id, generation);
                    return;
                }
                _ = sleep(ctx.config.watch_backoff) => {}
            }

            if ctx.locks.acquire(listener_id).await {
                continue;
            }
            // Lost to another instance; the acquisition poller retries later.
            debug!(%listener_id, "could not re-acquire after feed drop");
            set.remove_generation(listener_id, generation);
            return;
        }
    }
}
