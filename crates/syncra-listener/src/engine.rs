//! Engine wiring and lifecycle.
//!
//! A [`ListenerEngine`] is one of N identically-behaving instances with no
//! direct communication between them; all coordination goes through the
//! store's conditional updates. Within the process it owns the shared
//! context (repositories, scheduler, lock manager, cancellation token) and
//! spawns the heartbeat loop, both pollers, the registry watcher, and the
//! processor pool.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use syncra_core::{
    defaults, DocumentRepository, Error, JobScheduler, ListenerConfig, ListenerRepository, Result,
};

use crate::acquisition::run_acquisition_loop;
use crate::lease::LockManager;
use crate::processor::spawn_pool;
use crate::reconcile::run_reconcile_loop;
use crate::registry::run_registry_loop;
use crate::watcher::WatcherSet;

/// Event emitted by the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The engine started its loops.
    Started,
    /// The engine finished shutting down.
    Stopped,
    /// A lease was claimed by this instance.
    LeaseAcquired { listener_id: Uuid },
    /// A change-feed subscription became active.
    WatcherStarted { listener_id: Uuid },
    /// A watcher was stopped deliberately.
    WatcherStopped { listener_id: Uuid },
    /// A change feed dropped; the lease was released and a restart scheduled.
    WatcherErrored { listener_id: Uuid },
    /// A job was submitted and the completion record written.
    JobDispatched {
        listener_id: Uuid,
        document_id: Uuid,
        job_id: Uuid,
        job_name: String,
    },
    /// Job submission failed; left for reconciliation.
    DispatchFailed {
        listener_id: Uuid,
        document_id: Uuid,
        error: String,
    },
}

/// Shared state handed to every component of one engine instance.
pub(crate) struct EngineContext {
    pub listeners: Arc<dyn ListenerRepository>,
    pub documents: Arc<dyn DocumentRepository>,
    pub scheduler: Arc<dyn JobScheduler>,
    pub config: ListenerConfig,
    pub locks: LockManager,
    pub event_tx: broadcast::Sender<EngineEvent>,
    pub cancel: CancellationToken,
}

impl EngineContext {
    pub fn emit(&self, event: EngineEvent) {
        // Nobody listening is fine.
        let _ = self.event_tx.send(event);
    }

    #[cfg(test)]
    pub fn for_tests(
        listeners: Arc<dyn ListenerRepository>,
        documents: Arc<dyn DocumentRepository>,
        scheduler: Arc<dyn JobScheduler>,
        config: ListenerConfig,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(defaults::ENGINE_EVENT_CAPACITY);
        let owner_id = Uuid::new_v4().to_string();
        Arc::new(Self {
            locks: LockManager::new(listeners.clone(), owner_id, &config),
            listeners,
            documents,
            scheduler,
            config,
            event_tx,
            cancel: CancellationToken::new(),
        })
    }
}

/// The change-driven job dispatch engine.
pub struct ListenerEngine {
    ctx: Arc<EngineContext>,
    watchers: Arc<WatcherSet>,
}

impl ListenerEngine {
    /// Create an engine instance with a fresh random owner id.
    ///
    /// Fails fast on configuration that breaks the lease protocol
    /// ([`ListenerConfig::validate`]).
    pub fn new(
        listeners: Arc<dyn ListenerRepository>,
        documents: Arc<dyn DocumentRepository>,
        scheduler: Arc<dyn JobScheduler>,
        config: ListenerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let owner_id = Uuid::new_v4().to_string();
        let (event_tx, _) = broadcast::channel(defaults::ENGINE_EVENT_CAPACITY);
        let ctx = Arc::new(EngineContext {
            locks: LockManager::new(listeners.clone(), owner_id, &config),
            listeners,
            documents,
            scheduler,
            config,
            event_tx,
            cancel: CancellationToken::new(),
        });
        Ok(Self {
            ctx,
            watchers: Arc::new(WatcherSet::new()),
        })
    }

    /// The opaque instance identifier leases are claimed under.
    pub fn owner_id(&self) -> &str {
        self.ctx.locks.owner_id()
    }

    /// Start all loops and return a handle for control.
    pub fn start(self) -> EngineHandle {
        let ctx = self.ctx;
        let watchers = self.watchers;

        info!(
            owner_id = %ctx.locks.owner_id(),
            heartbeat_interval = ?ctx.config.heartbeat_interval,
            stale_threshold = ?ctx.config.stale_threshold,
            "listener engine starting"
        );

        let (tx, rx) = mpsc::channel(ctx.config.event_queue_capacity);

        // Processor pool; the supervisor just keeps the JoinSet alive.
        let mut pool = spawn_pool(ctx.clone(), rx);
        tokio::spawn(async move { while pool.join_next().await.is_some() {} });

        // Heartbeat loop.
        tokio::spawn({
            let ctx = ctx.clone();
            async move {
                ctx.locks.run_heartbeat_loop(ctx.cancel.clone()).await;
            }
        });

        // Lease acquisition poller.
        tokio::spawn({
            let ctx = ctx.clone();
            let watchers = watchers.clone();
            let tx = tx.clone();
            async move { run_acquisition_loop(ctx, watchers, tx).await }
        });

        // Reconciliation poller.
        tokio::spawn({
            let ctx = ctx.clone();
            let watchers = watchers.clone();
            let tx = tx.clone();
            async move { run_reconcile_loop(ctx, watchers, tx).await }
        });

        // Listener registry watcher.
        tokio::spawn({
            let ctx = ctx.clone();
            let watchers = watchers.clone();
            async move { run_registry_loop(ctx, watchers, tx).await }
        });

        ctx.emit(EngineEvent::Started);
        let event_rx = ctx.event_tx.subscribe();
        EngineHandle {
            ctx,
            watchers,
            event_rx,
        }
    }
}

/// Handle for controlling a running engine.
pub struct EngineHandle {
    ctx: Arc<EngineContext>,
    watchers: Arc<WatcherSet>,
    event_rx: broadcast::Receiver<EngineEvent>,
}

impl EngineHandle {
    /// Stop all loops, close every active change-feed subscription, and
    /// release every lease this instance holds, so other instances can
    /// reclaim ownership without waiting out the staleness window.
    /// Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        if self.ctx.cancel.is_cancelled() {
            return Ok(());
        }
        info!(owner_id = %self.ctx.locks.owner_id(), "listener engine shutting down");
        self.ctx.cancel.cancel();

        for listener_id in self.watchers.active_ids() {
            self.watchers.stop(listener_id);
        }

        // Release everything held under this owner, including leases whose
        // watcher was mid-restart and not in the set.
        match self.ctx.listeners.list().await {
            Ok(all) => {
                for listener in all {
                    if listener
                        .lease
                        .as_ref()
                        .is_some_and(|l| l.is_held_by(self.ctx.locks.owner_id()))
                    {
                        self.ctx.locks.release(listener.id).await;
                    }
                }
            }
            Err(e) => warn!(error = %e, "could not enumerate leases during shutdown"),
        }

        self.ctx.emit(EngineEvent::Stopped);
        info!(owner_id = %self.ctx.locks.owner_id(), "listener engine stopped");
        Ok(())
    }

    /// Get a receiver for engine events.
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_rx.resubscribe()
    }

    /// The instance identifier of the running engine.
    pub fn owner_id(&self) -> &str {
        self.ctx.locks.owner_id()
    }

    /// Listener ids with an active watcher in this process.
    pub fn active_listeners(&self) -> Vec<Uuid> {
        self.watchers.active_ids()
    }
}

/// Block until a termination signal, then shut the engine down gracefully.
pub async fn run_until_shutdown(handle: &EngineHandle) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::Internal(format!("failed to listen for shutdown signal: {e}")))?;
    handle.shutdown().await
}
