//! Lease acquisition poller.
//!
//! On a fixed interval, scans all active listeners with no lease or a stale
//! one and attempts to claim them, starting a change-feed watcher on
//! success. This is how work rebalances across instances after a crash: a
//! dead instance's leases go stale and are picked up by a live one within
//! one polling interval plus the staleness threshold.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, warn};

use crate::engine::{EngineContext, EngineEvent};
use crate::processor::ProcessRequest;
use crate::watcher::{start_watcher, WatcherSet};

pub(crate) async fn run_acquisition_loop(
    ctx: Arc<EngineContext>,
    set: Arc<WatcherSet>,
    tx: mpsc::Sender<ProcessRequest>,
) {
    let mut ticker = interval(ctx.config.acquire_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                debug!("acquisition poller stopped");
                return;
            }
            _ = ticker.tick() => acquisition_pass(&ctx, &set, &tx).await,
        }
    }
}

async fn acquisition_pass(
    ctx: &Arc<EngineContext>,
    set: &Arc<WatcherSet>,
    tx: &mpsc::Sender<ProcessRequest>,
) {
    let claimable = match ctx
        .listeners
        .list_claimable(ctx.locks.owner_id(), ctx.config.stale_threshold)
        .await
    {
        Ok(claimable) => claimable,
        Err(e) => {
            warn!(error = %e, "claimable listener scan failed");
            return;
        }
    };

    for listener in claimable {
        // Already watching it locally (e.g. a watcher mid-restart).
        if set.contains(listener.id) {
            continue;
        }
        if ctx.locks.acquire(listener.id).await {
            ctx.emit(EngineEvent::LeaseAcquired {
                listener_id: listener.id,
            });
            start_watcher(ctx, set, listener, tx.clone());
        }
    }
}
