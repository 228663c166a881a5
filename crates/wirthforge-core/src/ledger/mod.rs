//! Append-only energy event ledger.
//!
//! This module provides the durable event log for the pipeline, backed by
//! `SQLite` with WAL mode for concurrent reads while the writer appends.
//!
//! # Features
//!
//! - **Append-only semantics**: events can only be added, never modified or
//!   deleted
//! - **Gapless sequencing**: `seq` starts at 1 and increases by exactly 1 per
//!   append; a storage-level collision surfaces as a fatal
//!   [`LedgerError::SequenceConflict`], never a silent renumber
//! - **Single writer by construction**: [`EventLedger::writer`] hands out the
//!   one [`LedgerWriter`] per session; readers are unlimited
//! - **Cursor-based reads**: batched [`EventLedger::read_from`] and the lazy
//!   [`EventCursor`] iterator for replay
//!
//! # Example
//!
//! ```rust,no_run
//! use wirthforge_core::events::EventPayload;
//! use wirthforge_core::ledger::EventLedger;
//!
//! # fn example() -> Result<(), wirthforge_core::ledger::LedgerError> {
//! let ledger = EventLedger::open("/path/to/session.db")?;
//! let mut writer = ledger.writer()?;
//!
//! let event = writer.append(0.0, 1.0, EventPayload::SessionStart)?;
//! assert_eq!(event.seq, 1);
//!
//! for event in ledger.events_since(0) {
//!     let event = event?;
//!     println!("{} {}", event.seq, event.kind());
//! }
//! # Ok(())
//! # }
//! ```

mod storage;


pub use storage::{EventCursor, EventLedger, LedgerError, LedgerStats, LedgerWriter};
