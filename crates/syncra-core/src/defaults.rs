//! Centralized default constants for the syncra listener engine.
//!
//! **This module is the single source of truth** for all shared default
//! values. Crates should reference these constants instead of defining their
//! own magic numbers.

// =============================================================================
// LEASES
// =============================================================================

/// Interval between heartbeat refreshes for leases held by this instance.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 10;

/// Age beyond which a lease's last heartbeat marks it stale and reclaimable.
///
/// Must stay well above [`HEARTBEAT_INTERVAL_SECS`]; the default keeps a 3x
/// margin to absorb network jitter and modest clock skew between instances.
pub const LEASE_STALE_SECS: u64 = 30;

// =============================================================================
// POLLING
// =============================================================================

/// Interval between reconciliation passes over owned listeners.
pub const RECONCILE_INTERVAL_SECS: u64 = 30;

/// Interval between lease-acquisition scans for unowned or stale listeners.
pub const ACQUIRE_INTERVAL_SECS: u64 = 15;

/// Delay before a failed change-feed watcher attempts to re-acquire and
/// re-subscribe.
pub const WATCH_BACKOFF_SECS: u64 = 5;

// =============================================================================
// PROCESSING
// =============================================================================

/// Number of document-processor workers draining the change-event channel.
pub const PROCESSOR_WORKERS: usize = 4;

/// Bounded capacity of the change-event channel feeding the processor pool.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Capacity of the broadcast channel carrying engine lifecycle events.
pub const ENGINE_EVENT_CAPACITY: usize = 128;
