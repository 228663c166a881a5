//! `SQLite`-backed ledger storage implementation.
//!
//! The ledger uses WAL mode so the snapshot manager and replay tools can read
//! while the writer appends. The `seq` column is assigned by the writer, not
//! by the database, so a gap or collision is detectable rather than papered
//! over by autoincrement.

// SQLite returns i64 for row IDs and counts, but they're always non-negative.
// Mutex poisoning indicates a panic in another thread, which is unrecoverable.
#![allow(
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::missing_panics_doc
)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rusqlite::{Connection, OpenFlags, params};
use thiserror::Error;

use crate::events::{EnergyEvent, EventPayload};

/// Ledger schema, applied on open.
const LEDGER_SCHEMA: &str = r"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;

CREATE TABLE IF NOT EXISTS energy_events (
    seq INTEGER PRIMARY KEY,
    event_type TEXT NOT NULL,
    frame_time REAL NOT NULL,
    energy REAL NOT NULL,
    payload TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_energy_events_type
    ON energy_events(event_type, seq);
";

/// Batch size used by [`EventCursor`] when pulling events lazily.
const CURSOR_BATCH_SIZE: u64 = 256;

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error during database operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload serialization failed.
    #[error("payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The sequence counter and the stored log disagree. This is an internal
    /// invariant violation: surface it and halt the writer, never renumber.
    #[error("sequence conflict at seq={seq}: ledger already holds this position")]
    SequenceConflict {
        /// The sequence number that collided.
        seq: u64,
    },

    /// Energy outside `[0, 1]` reached the writer. Upstream clamping failed.
    #[error("energy {value} outside [0, 1]")]
    InvalidEnergy {
        /// The rejected energy value.
        value: f64,
    },

    /// A second writer was requested for this session.
    #[error("ledger writer already taken: one writer per session")]
    WriterTaken,

    /// Event not found.
    #[error("event not found: seq={seq}")]
    EventNotFound {
        /// The sequence number that was not found.
        seq: u64,
    },
}

/// Statistics about the ledger.
#[derive(Debug, Clone, Copy, Default)]
pub struct LedgerStats {
    /// Total number of events.
    pub event_count: u64,

    /// Highest sequence number (0 if empty).
    pub head_seq: u64,

    /// Database size in bytes.
    pub db_size_bytes: u64,
}

/// The append-only energy event ledger.
///
/// Cloning produces another read handle onto the same database; the
/// single-writer guarantee spans all clones.
#[derive(Clone)]
pub struct EventLedger {
    conn: Arc<std::sync::Mutex<Connection>>,
    writer_taken: Arc<AtomicBool>,
    #[allow(dead_code)]
    path: Option<PathBuf>,
}

impl EventLedger {
    /// Opens or creates a ledger at the specified path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        Self::initialize_connection(&conn)?;

        Ok(Self {
            conn: Arc::new(std::sync::Mutex::new(conn)),
            writer_taken: Arc::new(AtomicBool::new(false)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Creates an in-memory ledger for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_connection(&conn)?;

        Ok(Self {
            conn: Arc::new(std::sync::Mutex::new(conn)),
            writer_taken: Arc::new(AtomicBool::new(false)),
            path: None,
        })
    }

    fn initialize_connection(conn: &Connection) -> Result<(), LedgerError> {
        conn.execute_batch(LEDGER_SCHEMA)?;
        Ok(())
    }

    /// Takes the session's single writer.
    ///
    /// At most one writer exists at a time across all clones of this handle;
    /// dropping the writer releases the slot.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::WriterTaken`] while a writer is alive.
    pub fn writer(&self) -> Result<LedgerWriter, LedgerError> {
        if self.writer_taken.swap(true, Ordering::SeqCst) {
            return Err(LedgerError::WriterTaken);
        }

        let next_seq = match self.head() {
            Ok(head) => head + 1,
            Err(e) => {
                self.writer_taken.store(false, Ordering::SeqCst);
                return Err(e);
            },
        };
        Ok(LedgerWriter {
            conn: Arc::clone(&self.conn),
            taken: Arc::clone(&self.writer_taken),
            next_seq,
        })
    }

    /// Reads up to `limit` events with `seq > cursor`, in sequence order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a stored payload is malformed.
    pub fn read_from(&self, cursor: u64, limit: u64) -> Result<Vec<EnergyEvent>, LedgerError> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare_cached(
            "SELECT seq, event_type, frame_time, energy, payload
             FROM energy_events
             WHERE seq > ?1
             ORDER BY seq ASC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![cursor, limit], |row| {
            Ok((
                row.get::<_, i64>(0)? as u64,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            events.push(event_from_row(row?)?);
        }
        Ok(events)
    }

    /// Reads a single event by sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::EventNotFound`] if no event exists at `seq`.
    pub fn read_one(&self, seq: u64) -> Result<EnergyEvent, LedgerError> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare_cached(
            "SELECT seq, event_type, frame_time, energy, payload
             FROM energy_events
             WHERE seq = ?1",
        )?;

        let row = stmt
            .query_row(params![seq], |row| {
                Ok((
                    row.get::<_, i64>(0)? as u64,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => LedgerError::EventNotFound { seq },
                other => LedgerError::Database(other),
            })?;

        event_from_row(row)
    }

    /// Returns a lazy cursor over all events with `seq > cursor`.
    ///
    /// Events are pulled in batches; the cursor observes events appended
    /// after its creation, which is what the snapshot manager and live replay
    /// tools want. For a fixed range, stop at a captured [`Self::head`].
    #[must_use]
    pub fn events_since(&self, cursor: u64) -> EventCursor<'_> {
        EventCursor {
            ledger: self,
            cursor,
            buffered: std::collections::VecDeque::new(),
            exhausted: false,
        }
    }

    /// The highest sequence number in the ledger (0 if empty).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn head(&self) -> Result<u64, LedgerError> {
        let conn = self.conn.lock().unwrap();

        let max: Option<i64> =
            conn.query_row("SELECT MAX(seq) FROM energy_events", [], |row| row.get(0))?;

        Ok(max.unwrap_or(0) as u64)
    }

    /// Gets statistics about the ledger.
    ///
    /// # Errors
    ///
    /// Returns an error if statistics cannot be gathered.
    pub fn stats(&self) -> Result<LedgerStats, LedgerError> {
        let conn = self.conn.lock().unwrap();

        let event_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM energy_events", [], |row| row.get(0))?;
        let head_seq: Option<i64> =
            conn.query_row("SELECT MAX(seq) FROM energy_events", [], |row| row.get(0))?;

        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;

        Ok(LedgerStats {
            event_count: event_count as u64,
            head_seq: head_seq.unwrap_or(0) as u64,
            db_size_bytes: (page_count * page_size) as u64,
        })
    }
}

/// The single append handle for a session.
///
/// Owns the next-sequence counter. Constructed only via
/// [`EventLedger::writer`], which enforces one writer per session.
pub struct LedgerWriter {
    conn: Arc<std::sync::Mutex<Connection>>,
    taken: Arc<AtomicBool>,
    next_seq: u64,
}

impl Drop for LedgerWriter {
    fn drop(&mut self) {
        self.taken.store(false, Ordering::SeqCst);
    }
}

impl LedgerWriter {
    /// Appends one event, assigning the next sequence number.
    ///
    /// The event is durable (written through WAL) before this returns.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidEnergy`] if `energy` is NaN or outside
    ///   `[0, 1]`
    /// - [`LedgerError::SequenceConflict`] if storage already holds the next
    ///   sequence position; this indicates a second writer or external
    ///   mutation and is fatal
    /// - [`LedgerError::Database`] for other storage failures
    pub fn append(
        &mut self,
        frame_time: f64,
        energy: f64,
        payload: EventPayload,
    ) -> Result<EnergyEvent, LedgerError> {
        validate_energy(energy)?;
        let payload_json = serde_json::to_string(&payload.to_value()?)?;
        let seq = self.next_seq;

        {
            let conn = self.conn.lock().unwrap();
            let result = conn.execute(
                "INSERT INTO energy_events (seq, event_type, frame_time, energy, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![seq, payload.kind(), frame_time, energy, payload_json],
            );

            if let Err(e) = result {
                return Err(map_insert_error(e, seq));
            }
        }

        self.next_seq += 1;
        Ok(EnergyEvent {
            seq,
            frame_time,
            energy,
            payload,
        })
    }

    /// Appends multiple events in a single transaction.
    ///
    /// Sequence numbers are assigned in input order. On error nothing is
    /// inserted and the counter is unchanged.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::append`].
    pub fn append_batch(
        &mut self,
        items: Vec<(f64, f64, EventPayload)>,
    ) -> Result<Vec<EnergyEvent>, LedgerError> {
        let mut events = Vec::with_capacity(items.len());
        let mut seq = self.next_seq;

        {
            let mut conn = self.conn.lock().unwrap();
            let tx = conn.transaction()?;

            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO energy_events (seq, event_type, frame_time, energy, payload)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;

                for (frame_time, energy, payload) in items {
                    validate_energy(energy)?;
                    let payload_json = serde_json::to_string(&payload.to_value()?)?;

                    stmt.execute(params![
                        seq,
                        payload.kind(),
                        frame_time,
                        energy,
                        payload_json
                    ])
                    .map_err(|e| map_insert_error(e, seq))?;

                    events.push(EnergyEvent {
                        seq,
                        frame_time,
                        energy,
                        payload,
                    });
                    seq += 1;
                }
            }

            tx.commit()?;
        }

        self.next_seq = seq;
        Ok(events)
    }

    /// The sequence number the next append will receive.
    #[must_use]
    pub const fn next_seq(&self) -> u64 {
        self.next_seq
    }
}

/// Lazy, batching iterator over ledger events.
///
/// Yields events in sequence order. Errors terminate iteration after being
/// yielded once.
pub struct EventCursor<'a> {
    ledger: &'a EventLedger,
    cursor: u64,
    buffered: std::collections::VecDeque<EnergyEvent>,
    exhausted: bool,
}

impl Iterator for EventCursor<'_> {
    type Item = Result<EnergyEvent, LedgerError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(event) = self.buffered.pop_front() {
            self.cursor = event.seq;
            return Some(Ok(event));
        }
        if self.exhausted {
            return None;
        }

        match self.ledger.read_from(self.cursor, CURSOR_BATCH_SIZE) {
            Ok(batch) => {
                if batch.is_empty() {
                    self.exhausted = true;
                    return None;
                }
                self.buffered.extend(batch);
                let event = self.buffered.pop_front()?;
                self.cursor = event.seq;
                Some(Ok(event))
            },
            Err(e) => {
                self.exhausted = true;
                Some(Err(e))
            },
        }
    }
}

fn validate_energy(energy: f64) -> Result<(), LedgerError> {
    if energy.is_nan() || !(0.0..=1.0).contains(&energy) {
        return Err(LedgerError::InvalidEnergy { value: energy });
    }
    Ok(())
}

fn map_insert_error(e: rusqlite::Error, seq: u64) -> LedgerError {
    match e {
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            LedgerError::SequenceConflict { seq }
        },
        other => LedgerError::Database(other),
    }
}

fn event_from_row(
    (seq, event_type, frame_time, energy, payload_json): (u64, String, f64, f64, String),
) -> Result<EnergyEvent, LedgerError> {
    let value: serde_json::Value = serde_json::from_str(&payload_json)?;
    let payload = EventPayload::from_parts(&event_type, value)?;

    Ok(EnergyEvent {
        seq,
        frame_time,
        energy,
        payload,
    })
}
