//! Structured logging schema and field name constants for syncra.
//!
//! All crates use these constants for consistent structured logging fields,
//! so log aggregation tools can query by standardized field names across
//! every subsystem.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events (startup, shutdown), lease transitions |
//! | DEBUG | Decision points: skips, contention, config choices |
//! | TRACE | Per-event iteration, high-volume data |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Listener UUID being watched or processed.
pub const LISTENER_ID: &str = "listener_id";

/// Opaque instance identifier holding or contending for a lease.
pub const OWNER_ID: &str = "owner_id";

/// Target collection of a listener or change event.
pub const COLLECTION: &str = "collection";

/// Document UUID being processed.
pub const DOCUMENT_ID: &str = "document_id";

// ─── Dispatch fields ───────────────────────────────────────────────────────

/// Background job type dispatched on a qualifying change.
pub const JOB_NAME: &str = "job_name";

/// Scheduler-assigned job UUID.
pub const JOB_ID: &str = "job_id";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of leases refreshed by a heartbeat pass.
pub const LEASE_COUNT: &str = "lease_count";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";

/// Initialize a process-wide tracing subscriber from `RUST_LOG`.
///
/// Falls back to `info` when no filter is set. Safe to call once at startup;
/// returns quietly if a subscriber is already installed (tests).
pub fn init() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
