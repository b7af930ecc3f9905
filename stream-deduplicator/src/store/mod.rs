//! Versioned, partitioned key-value state.
//!
//! Every committed batch produces one new version per operator partition.
//! Version `n` is version `n - 1` plus the puts and removes of batch `n`, and
//! version `0` is the empty store. Versions are persisted through a
//! [`StateBackend`] as delta files, with periodic full snapshots that bound
//! replay time and allow old files to be deleted by maintenance.

pub mod backend;
pub mod files;
pub mod provider;
pub mod state_store;

pub use backend::{InMemoryStateBackend, LocalStateBackend, StateBackend};
pub use files::{DeltaOp, StateFile, StateFileKind};
pub use provider::{StateMap, StateStoreConfig, StateStoreProvider};
pub use state_store::StateStore;

/// Partition of the key space, assigned by the pipeline partitioner.
pub type PartitionId = u32;

/// State version, equal to the id of the batch that produced it.
pub type Version = u64;
