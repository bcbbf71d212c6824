//! Reconciliation poller: the correctness backstop for missed change events.
//!
//! Change feeds can drop events (subscription restarts, feed gaps, writes
//! that predate a listener's lease acquisition). On a fixed interval this
//! poller scans the target collections of every listener this instance owns
//! for documents whose per-listener status never reached complete, and
//! re-drives them through the processor pool. The processor's idempotency
//! check makes this safe to run concurrently with live events for the same
//! document.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, trace, warn};

use syncra_core::models::doc_id;
use syncra_core::{ChangeEvent, Listener, OperationType};

use crate::engine::EngineContext;
use crate::processor::ProcessRequest;
use crate::watcher::WatcherSet;

pub(crate) async fn run_reconcile_loop(
    ctx: Arc<EngineContext>,
    set: Arc<WatcherSet>,
    tx: mpsc::Sender<ProcessRequest>,
) {
    let mut ticker = interval(ctx.config.reconcile_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                debug!("reconciliation poller stopped");
                return;
            }
            _ = ticker.tick() => reconcile_pass(&ctx, &set, &tx).await,
        }
    }
}

async fn reconcile_pass(
    ctx: &Arc<EngineContext>,
    set: &Arc<WatcherSet>,
    tx: &mpsc::Sender<ProcessRequest>,
) {
    // The watcher set stands in for "listeners this instance leases": the two
    // diverge only inside a feed-drop backoff window, and a listener missed
    // there is reconciled one interval later.
    for listener_id in set.active_ids() {
        // Fetch fresh configuration; the listener may have changed or been
        // removed since the watcher started.
        let listener = match ctx.listeners.get(listener_id).await {
            Ok(Some(listener)) if listener.is_active => listener,
            Ok(_) => continue,
            Err(e) => {
                warn!(%listener_id, error = %e, "reconciliation: listener fetch failed");
                continue;
            }
        };

        let pending = match ctx
            .documents
            .find_pending(&listener.collection, listener_id)
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                warn!(%listener_id, collection = %listener.collection, error = %e,
                    "reconciliation: pending query failed");
                continue;
            }
        };
        if pending.is_empty() {
            continue;
        }
        debug!(%listener_id, collection = %listener.collection,
            pending = pending.len(), "reconciling incomplete documents");

        for doc in pending {
            let Some(document_id) = doc_id(&doc) else {
                trace!(%listener_id, "reconciliation: document without internal id");
                continue;
            };
            let request = ProcessRequest {
                listener: listener.clone(),
                event: synthetic_event(&listener, document_id, doc),
            };
            if tx.send(request).await.is_err() {
                return;
            }
        }
    }
}

/// Reconciliation bypasses the feed, so it synthesizes an update-shaped
/// event with no touched fields: never metadata-only, never scoped out.
fn synthetic_event(
    listener: &Listener,
    document_id: uuid::Uuid,
    doc: serde_json::Value,
) -> ChangeEvent {
    ChangeEvent {
        operation_type: OperationType::Update,
        collection: listener.collection.clone(),
        document_id,
        full_document: Some(doc),
        updated_fields: vec![],
    }
}
