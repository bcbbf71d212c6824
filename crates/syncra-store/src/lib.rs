//! # syncra-store
//!
//! Store adapters for the syncra listener engine.
//!
//! The engine sees the document store only through the repository traits in
//! [`syncra_core::traits`]; this crate provides the in-process reference
//! adapter ([`MemoryStore`]) implementing that contract: per-collection JSON
//! documents, dotted-path field patches, atomic conditional lease writes, and
//! change feeds with explicit error signaling. Production deployments plug a
//! real document-store driver in behind the same traits.
//!
//! [`RecordingScheduler`] is the matching reference implementation of the job
//! scheduler interface, used by local operation and the engine's tests.

pub mod memory;
pub mod scheduler;

// Re-export core types
pub use syncra_core::*;

pub use memory::MemoryStore;
pub use scheduler::RecordingScheduler;
