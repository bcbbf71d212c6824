//! # syncra-core
//!
//! Core types, traits, and abstractions for the syncra listener engine.
//!
//! This crate provides the foundational data structures and trait definitions
//! that the store adapters and the listener engine depend on: the persisted
//! [`Listener`] registration schema, the per-listener processing record kept
//! on target documents, the lease type used for distributed ownership, and
//! the repository/scheduler traits every store adapter implements.

pub mod config;
pub mod defaults;
pub mod error;
pub mod logging;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use config::ListenerConfig;
pub use error::{Error, Result};
pub use models::{
    ChangeEvent, ChangeFilter, Lease, Listener, ListenerEvent, ListenerMetadata, ListenerRun,
    OperationType, RunStatus,
};
pub use traits::{
    ChangeStream, DocumentRepository, JobScheduler, ListenerEventStream, ListenerRepository,
};
