//! Listener registry watcher.
//!
//! Subscribes to changes on the listener records themselves so watchers
//! start and stop without waiting for the next acquisition poll: inserts are
//! claimed best-effort, config updates restart the watcher to pick up new
//! filters, deletes tear the watcher down and release the lease.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use syncra_core::{Listener, ListenerEvent};

use crate::engine::{EngineContext, EngineEvent};
use crate::processor::ProcessRequest;
use crate::watcher::{start_watcher, WatcherSet};

pub(crate) async fn run_registry_loop(
    ctx: Arc<EngineContext>,
    set: Arc<WatcherSet>,
    tx: mpsc::Sender<ProcessRequest>,
) {
    loop {
        let mut stream = match ctx.listeners.watch_registry().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "registry subscription failed");
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return,
                    _ = sleep(ctx.config.watch_backoff) => continue,
                }
            }
        };
        debug!("registry watcher active");

        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    stream.close();
                    debug!("registry watcher stopped");
                    return;
                }
                item = stream.recv() => match item {
                    Some(Ok(event)) => handle_event(&ctx, &set, &tx, event).await,
                    Some(Err(e)) => {
                        // The acquisition poller covers the gap until the
                        // subscription is back.
                        warn!(error = %e, "registry feed dropped");
                        break;
                    }
                    None => break,
                }
            }
        }

        tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            _ = sleep(ctx.config.watch_backoff) => {}
        }
    }
}

async fn handle_event(
    ctx: &Arc<EngineContext>,
    set: &Arc<WatcherSet>,
    tx: &mpsc::Sender<ProcessRequest>,
    event: ListenerEvent,
) {
    match event {
        ListenerEvent::Created(listener) => {
            if listener.is_active {
                // Best-effort; a lost race is caught by the next
                // acquisition poll.
                try_claim(ctx, set, tx, listener).await;
            }
        }
        ListenerEvent::Updated(listener) => {
            if !set.contains(listener.id) {
                return;
            }
            info!(listener_id = %listener.id, "listener updated; restarting watcher");
            set.stop(listener.id);
            if listener.is_active {
                // The lease is still ours, so the claim cannot be lost.
                try_claim(ctx, set, tx, listener).await;
            } else {
                ctx.locks.release(listener.id).await;
            }
        }
        ListenerEvent::Deleted(listener_id) => {
            if set.contains(listener_id) {
                info!(%listener_id, "listener deleted; stopping watcher");
                set.stop(listener_id);
                ctx.locks.release(listener_id).await;
            }
        }
    }
}

async fn try_claim(
    ctx: &Arc<EngineContext>,
    set: &Arc<WatcherSet>,
    tx: &mpsc::Sender<ProcessRequest>,
    listener: Listener,
) {
    if ctx.locks.acquire(listener.id).await {
        ctx.emit(EngineEvent::LeaseAcquired {
            listener_id: listener.id,
        });
        start_watcher(ctx, set, listener, tx.clone());
    }
}
