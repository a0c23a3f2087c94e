//! # Resilience Store
//!
//! Keeps three copies of the journal from diverging:
//!
//! 1. the durable local store ([`EntryRepository`], one JSON value per key)
//! 2. the in-memory reactive state ([`ResilienceStore`])
//! 3. the remote mirror ([`RemoteMirror`], best effort, never blocking)
//!
//! Local writes go through the repository first, then memory, then the
//! metrics are recomputed and a snapshot is published. The mirror is fed
//! from a queue afterwards and its outcome never flows back.

pub mod backend;
pub mod error;
pub mod mirror;
pub mod reconcile;
pub mod repository;
pub mod rest;
pub mod store;

pub use backend::{FileBackend, KvBackend, MemoryBackend};
pub use error::{MirrorError, RepositoryError, StoreError};
pub use mirror::{MirrorHandle, MirrorOp, MirrorStatus, RemoteMirror, RetryConfig};
pub use reconcile::{merge_last_write_wins, MergeOutcome};
pub use repository::{EntryRepository, FileRepository, KvEntryRepository, MemoryRepository};
pub use rest::RestMirror;
pub use store::{AppState, ReconcileReport, ResilienceStore};

#[cfg(test)]
mod tests;
