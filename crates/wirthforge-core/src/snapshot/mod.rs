//! Snapshot storage and the periodic fold manager.
//!
//! Snapshots bound replay cost: instead of folding the whole ledger on
//! restart, a consumer loads the latest snapshot and folds only the tail.
//!
//! ```text
//! EnergyEvents (ledger) --> SnapshotManager --> Snapshot (store)
//!                               |
//!                        EnergyAggregateReducer
//! ```
//!
//! The snapshot store is a separate database from the ledger and is
//! disposable: losing it costs a full replay, never data. Snapshots are
//! superseded by later snapshots, not mutated, and snapshotting never deletes
//! ledger events.

mod manager;
mod store;

pub use manager::{SnapshotError, SnapshotManager};
pub use store::{Snapshot, SnapshotStore, SnapshotStoreError};
