//! wirthforge-core - WIRTHFORGE energy telemetry core
//!
//! This crate implements the storage and computation layer of the WIRTHFORGE
//! energy pipeline: it turns per-token inference telemetry into normalized
//! energy events, records them in an append-only ledger, and folds the ledger
//! into compact snapshots for fast restart and bounded replay.
//!
//! # Architecture
//!
//! ```text
//! TokenSample --> SignalExtractor --> Measurement --> EnergyFunction
//!                                                          |
//!                                                     EnergyEvent
//!                                                          |
//!                                 LedgerWriter (append-only, gapless seq)
//!                                       |                    |
//!                                 EventLedger          SnapshotManager
//!                                 (readers)            (periodic fold)
//! ```
//!
//! # Modules
//!
//! - [`signal`]: Normalizes raw token telemetry into measurement tuples
//! - [`energy`]: Pure, deterministic energy computation over a measurement
//! - [`events`]: Durable event record and its typed payload envelope
//! - [`ledger`]: Append-only `SQLite` event ledger with single-writer append
//! - [`reducer`]: Deterministic fold framework over ledger events
//! - [`snapshot`]: Snapshot storage and the periodic fold manager
//! - [`config`]: Pipeline configuration (TOML)
//!
//! # Ordering and Durability
//!
//! Energy events are totally ordered by a gapless `seq` starting at 1. The
//! ledger has exactly one writer per session, enforced by construction; reads
//! never require exclusive access because the written prefix is immutable.

pub mod config;
pub mod energy;
pub mod events;
pub mod ledger;
pub mod reducer;
pub mod signal;
pub mod snapshot;

pub use config::{PipelineConfig, ConfigError};
pub use energy::{EnergyError, EnergyFunction, EnergySample, EnergyWeights};
pub use events::{EnergyEvent, EventPayload};
pub use ledger::{EventLedger, LedgerError, LedgerWriter};
pub use signal::{Measurement, SignalExtractor, TokenSample};
pub use snapshot::{Snapshot, SnapshotError, SnapshotManager, SnapshotStore};
