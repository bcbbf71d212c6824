//! Lease acquisition, heartbeating, and release.
//!
//! Leases avoid a consensus protocol: correctness depends only on the store's
//! atomic conditional-update primitive and on clocks being roughly
//! synchronized across instances. The staleness threshold must exceed the
//! heartbeat interval plus expected network jitter by a healthy margin
//! (3x at the defaults: 30s staleness vs 10s heartbeat). Clock skew between
//! instances is assumed to stay well inside that margin; it is not measured
//! at runtime.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use syncra_core::{ListenerConfig, ListenerRepository};

/// Acquires, renews, and releases per-listener leases on behalf of one
/// engine instance.
pub struct LockManager {
    listeners: Arc<dyn ListenerRepository>,
    owner_id: String,
    stale_threshold: Duration,
    heartbeat_interval: Duration,
}

impl LockManager {
    pub fn new(listeners: Arc<dyn ListenerRepository>, owner_id: String, config: &ListenerConfig) -> Self {
        Self {
            listeners,
            owner_id,
            stale_threshold: config.stale_threshold,
            heartbeat_interval: config.heartbeat_interval,
        }
    }

    /// The opaque instance identifier this manager claims leases under.
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Attempt to claim the lease for a listener.
    ///
    /// Succeeds only if the lease is absent, already held by this owner, or
    /// stale. Contention and store errors are both non-fatal: the caller
    /// simply does not start a watcher this cycle and retries on the next
    /// acquisition pass.
    pub async fn acquire(&self, listener_id: Uuid) -> bool {
        match self
            .listeners
            .acquire_lease(listener_id, &self.owner_id, self.stale_threshold)
            .await
        {
            Ok(true) => {
                info!(%listener_id, owner_id = %self.owner_id, "lease acquired");
                true
            }
            Ok(false) => {
                debug!(%listener_id, owner_id = %self.owner_id, "lease contended");
                false
            }
            Err(e) => {
                warn!(%listener_id, error = %e, "lease acquire failed");
                false
            }
        }
    }

    /// Release a lease if still held by this owner. Idempotent.
    pub async fn release(&self, listener_id: Uuid) {
        if let Err(e) = self
            .listeners
            .release_lease(listener_id, &self.owner_id)
            .await
        {
            warn!(%listener_id, error = %e, "lease release failed");
        }
    }

    /// Refresh every lease held by this owner, in bulk, on a fixed interval
    /// until cancelled.
    pub async fn run_heartbeat_loop(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(owner_id = %self.owner_id, "heartbeat loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match self.listeners.heartbeat(&self.owner_id).await {
                        Ok(count) if count > 0 => {
                            debug!(owner_id = %self.owner_id, lease_count = count, "heartbeat");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(owner_id = %self.owner_id, error = %e, "heartbeat failed"),
                    }
                }
            }
        }
    }
}
