//! # syncra-listener
//!
//! Change-driven job dispatch engine for syncra.
//!
//! This crate watches designated collections for changes, guarantees that
//! each registered listener is owned by exactly one running instance at a
//! time via a lease-based distributed lock, turns qualifying change events
//! into exactly-once-per-listener background jobs, and reconciles missed
//! events through periodic polling.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use syncra_listener::{ListenerEngine, run_until_shutdown};
//! use syncra_core::ListenerConfig;
//! use syncra_store::{MemoryStore, RecordingScheduler};
//!
//! let store = Arc::new(MemoryStore::new());
//! let scheduler = Arc::new(RecordingScheduler::new());
//! let engine = ListenerEngine::new(
//!     store.clone(),
//!     store,
//!     scheduler,
//!     ListenerConfig::from_env(),
//! )?;
//!
//! let handle = engine.start();
//! run_until_shutdown(&handle).await?;
//! ```

pub mod acquisition;
pub mod engine;
pub mod lease;
pub mod processor;
pub mod reconcile;
pub mod registry;
pub mod watcher;

// Re-export core types
pub use syncra_core::*;

pub use engine::{run_until_shutdown, EngineEvent, EngineHandle, ListenerEngine};
pub use lease::LockManager;
pub use processor::{DocumentProcessor, ProcessOutcome, ProcessRequest, SkipReason};
pub use watcher::WatcherSet;
