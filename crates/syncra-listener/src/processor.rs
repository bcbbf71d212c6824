//! Turns qualifying change events into background jobs, exactly once per
//! (document, listener) completion cycle.
//!
//! Processing is idempotent under at-least-once delivery: live change events
//! and reconciliation passes can both hand the same document to the pool
//! without double-dispatching, because dispatch is gated on the per-listener
//! status re-read from the store. A narrow double-dispatch window remains
//! between the in-progress marker and the completion record if two processes
//! race past the status read simultaneously; with no consensus layer this is
//! accepted as best-effort, and the read and guarded write are kept adjacent
//! to minimize it.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use syncra_core::models::{doc_listener_run, doc_object_type};
use syncra_core::{ChangeEvent, Listener, ListenerRun, Result};

use crate::engine::{EngineContext, EngineEvent};

/// A unit of work handed to the processor pool: one change event and the
/// listener that should react to it.
pub struct ProcessRequest {
    pub listener: Listener,
    pub event: ChangeEvent,
}

/// Why a change event produced no job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Every updated field sits under `metadata`; the change originated from
    /// this subsystem's own bookkeeping.
    MetadataOnly,
    /// The document's object type does not apply to this listener.
    TypeMismatch,
    /// The per-listener status is already complete.
    AlreadyComplete,
    /// The document no longer exists (deleted, or never existed).
    DocumentMissing,
}

/// Outcome of processing one (document, listener) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// A job was submitted and the completion record written.
    Dispatched(Uuid),
    /// A skip condition held; no side effects beyond logging.
    Skipped(SkipReason),
    /// Job submission failed; the failure was recorded on the document and
    /// reconciliation will revisit it.
    SubmitFailed,
}

/// Decides applicability, performs the idempotent state transition on the
/// document's per-listener metadata, and dispatches a background job.
pub struct DocumentProcessor {
    ctx: Arc<EngineContext>,
}

impl DocumentProcessor {
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Process one change event for one listener.
    pub async fn process(&self, listener: &Listener, event: &ChangeEvent) -> Result<ProcessOutcome> {
        let start = Instant::now();
        let listener_id = listener.id;
        let document_id = event.document_id;

        // Bookkeeping writes from this subsystem never re-trigger dispatch.
        if event.is_metadata_only() {
            debug!(%listener_id, %document_id, "skip: metadata-only change");
            return Ok(ProcessOutcome::Skipped(SkipReason::MetadataOnly));
        }

        // Re-read the document so the applicability and idempotency checks
        // run against current state, as close to the in-progress write as
        // the store allows.
        let Some(doc) = self
            .ctx
            .documents
            .get(&listener.collection, document_id)
            .await?
        else {
            debug!(%listener_id, %document_id, "skip: document missing");
            return Ok(ProcessOutcome::Skipped(SkipReason::DocumentMissing));
        };

        if !listener.metadata.accepts_object_type(doc_object_type(&doc)) {
            debug!(
                %listener_id, %document_id,
                object_type = doc_object_type(&doc).unwrap_or("<none>"),
                "skip: object type does not apply"
            );
            return Ok(ProcessOutcome::Skipped(SkipReason::TypeMismatch));
        }

        if doc_listener_run(&doc, listener_id).is_some_and(|r| r.is_complete()) {
            debug!(%listener_id, %document_id, "skip: already complete");
            return Ok(ProcessOutcome::Skipped(SkipReason::AlreadyComplete));
        }

        // Guarded init, then the in-progress marker. Two field-level writes
        // by design: a whole-document write here could clobber sibling
        // listeners' entries.
        self.ctx
            .documents
            .init_listener_map(&listener.collection, document_id)
            .await?;
        self.ctx
            .documents
            .set_listener_run(
                &listener.collection,
                document_id,
                listener_id,
                &ListenerRun::started(Utc::now()),
            )
            .await?;

        let payload = build_payload(listener, &doc, document_id);

        match self.ctx.scheduler.submit(&listener.job_name, payload).await {
            Ok(job_id) => {
                self.ctx
                    .documents
                    .set_listener_run(
                        &listener.collection,
                        document_id,
                        listener_id,
                        &ListenerRun::completed(job_id),
                    )
                    .await?;
                info!(
                    %listener_id, %document_id, %job_id,
                    job_name = %listener.job_name,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "job dispatched"
                );
                self.ctx.emit(EngineEvent::JobDispatched {
                    listener_id,
                    document_id,
                    job_id,
                    job_name: listener.job_name.clone(),
                });
                Ok(ProcessOutcome::Dispatched(job_id))
            }
            Err(e) => {
                // No inline retry: the status stays non-complete, so the
                // reconciliation poller revisits this document.
                warn!(
                    %listener_id, %document_id,
                    job_name = %listener.job_name,
                    error = %e,
                    "job submission failed; left for reconciliation"
                );
                self.ctx
                    .documents
                    .set_listener_run(
                        &listener.collection,
                        document_id,
                        listener_id,
                        &ListenerRun::failed(e.to_string(), Utc::now()),
                    )
                    .await?;
                self.ctx.emit(EngineEvent::DispatchFailed {
                    listener_id,
                    document_id,
                    error: e.to_string(),
                });
                Ok(ProcessOutcome::SubmitFailed)
            }
        }
    }
}

/// Build the job payload: document metadata first, listener metadata over it
/// (listener values win on key conflicts), then the explicit required fields.
fn build_payload(listener: &Listener, doc: &Value, document_id: Uuid) -> Value {
    let mut payload = Map::new();

    if let Some(meta) = doc.get("metadata").and_then(Value::as_object) {
        for (key, value) in meta {
            // The per-listener bookkeeping map is not job input.
            if key != "listeners" {
                payload.insert(key.clone(), value.clone());
            }
        }
    }

    if let Ok(Value::Object(listener_meta)) = serde_json::to_value(&listener.metadata) {
        for (key, value) in listener_meta {
            payload.insert(key, value);
        }
    }

    payload.insert(
        "workspaceId".to_string(),
        Value::String(listener.metadata.workspace_id.clone()),
    );
    if let Some(object_type) = listener
        .metadata
        .object_type
        .clone()
        .or_else(|| doc_object_type(doc).map(String::from))
    {
        payload.insert("objectType".to_string(), Value::String(object_type));
    }
    // Always the internal identifier, never an externally sourced ID, so ids
    // cannot collide across sources.
    payload.insert(
        "objectId".to_string(),
        Value::String(document_id.to_string()),
    );
    payload.insert(
        "collection".to_string(),
        Value::String(listener.collection.clone()),
    );
    payload.insert(
        "listenerId".to_string(),
        Value::String(listener.id.to_string()),
    );

    Value::Object(payload)
}

/// Spawn the processor worker pool draining `rx`.
///
/// Workers run until the engine is cancelled and the channel drained or
/// closed; an in-flight document finishes processing rather than being
/// aborted.
pub(crate) fn spawn_pool(
    ctx: Arc<EngineContext>,
    rx: mpsc::Receiver<ProcessRequest>,
) -> JoinSet<()> {
    let rx = Arc::new(Mutex::new(rx));
    let mut pool = JoinSet::new();
    for worker in 0..ctx.config.processor_workers {
        let ctx = ctx.clone();
        let rx = rx.clone();
        pool.spawn(async move {
            let processor = DocumentProcessor::new(ctx.clone());
            loop {
                let request = {
                    let mut rx = rx.lock().await;
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => None,
                        request = rx.recv() => request,
                    }
                };
                let Some(ProcessRequest { listener, event }) = request else {
                    debug!(worker, "processor worker stopped");
                    return;
                };
                if let Err(e) = processor.process(&listener, &event).await {
                    // Single-document failures are contained; they must never
                    // stop other listeners' processing.
                    warn!(
                        listener_id = %listener.id,
                        document_id = %event.document_id,
                        error = %e,
                        "document processing failed"
                    );
                }
            }
        });
    }
    pool
}
