//! `SQLite`-backed snapshot storage.

// SQLite returns i64 for row IDs and counts, but they're always non-negative.
// Timestamps won't overflow u64 until the year 2554.
// Mutex poisoning indicates a panic in another thread, which is unrecoverable.
#![allow(
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::missing_panics_doc
)]

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use thiserror::Error;

/// Snapshot schema, applied on open.
const SNAPSHOT_SCHEMA: &str = r"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;

CREATE TABLE IF NOT EXISTS snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    reducer_name TEXT NOT NULL,
    frame_seq INTEGER NOT NULL,
    state_data BLOB NOT NULL,
    created_at_ns INTEGER NOT NULL,
    UNIQUE(reducer_name, frame_seq)
);

CREATE INDEX IF NOT EXISTS idx_snapshots_reducer_seq
    ON snapshots(reducer_name, frame_seq DESC);
";

/// Errors that can occur during snapshot store operations.
#[derive(Debug, Error)]
pub enum SnapshotStoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error during database operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No snapshot stored for this reducer.
    #[error("no snapshot found for reducer '{reducer_name}'")]
    NotFound {
        /// The reducer name that was not found.
        reducer_name: String,
    },
}

/// A point-in-time fold of the event log.
///
/// Replaying events `1..=frame_seq` from the empty state reproduces
/// `state_data` exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Unique identifier, assigned by the store.
    pub id: Option<u64>,

    /// Name of the reducer that produced this state.
    pub reducer_name: String,

    /// Last sequence number included in the fold.
    pub frame_seq: u64,

    /// Canonically serialized reducer state.
    pub state_data: Vec<u8>,

    /// Timestamp when the snapshot was created.
    pub created_at_ns: u64,
}

impl Snapshot {
    /// Creates a snapshot with the current timestamp.
    #[must_use]
    pub fn new(reducer_name: impl Into<String>, frame_seq: u64, state_data: Vec<u8>) -> Self {
        let created_at_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        Self {
            id: None,
            reducer_name: reducer_name.into(),
            frame_seq,
            state_data,
            created_at_ns,
        }
    }
}

/// Storage for snapshots, separate from the event ledger.
pub struct SnapshotStore {
    conn: Arc<std::sync::Mutex<Connection>>,
}

impl SnapshotStore {
    /// Opens or creates a snapshot store at the specified path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SnapshotStoreError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        Self::initialize_connection(&conn)?;

        Ok(Self {
            conn: Arc::new(std::sync::Mutex::new(conn)),
        })
    }

    /// Creates an in-memory snapshot store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, SnapshotStoreError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_connection(&conn)?;

        Ok(Self {
            conn: Arc::new(std::sync::Mutex::new(conn)),
        })
    }

    fn initialize_connection(conn: &Connection) -> Result<(), SnapshotStoreError> {
        conn.execute_batch(SNAPSHOT_SCHEMA)?;
        Ok(())
    }

    /// Saves a snapshot, superseding any earlier one at the same position.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be saved.
    pub fn save(&self, snapshot: &Snapshot) -> Result<u64, SnapshotStoreError> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "INSERT OR REPLACE INTO snapshots (reducer_name, frame_seq, state_data, created_at_ns)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                snapshot.reducer_name,
                snapshot.frame_seq,
                snapshot.state_data,
                snapshot.created_at_ns,
            ],
        )?;

        Ok(conn.last_insert_rowid() as u64)
    }

    /// Loads the snapshot with the highest `frame_seq` for a reducer.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no snapshot exists for this reducer.
    pub fn load_latest(&self, reducer_name: &str) -> Result<Snapshot, SnapshotStoreError> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT id, reducer_name, frame_seq, state_data, created_at_ns
             FROM snapshots
             WHERE reducer_name = ?1
             ORDER BY frame_seq DESC
             LIMIT 1",
        )?;

        stmt.query_row(params![reducer_name], row_to_snapshot)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => SnapshotStoreError::NotFound {
                    reducer_name: reducer_name.to_string(),
                },
                other => SnapshotStoreError::Database(other),
            })
    }

    /// Loads the snapshot at or before a specific sequence number.
    ///
    /// This finds the best starting point for a bounded tail replay.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no suitable snapshot exists.
    pub fn load_at_or_before(
        &self,
        reducer_name: &str,
        frame_seq: u64,
    ) -> Result<Snapshot, SnapshotStoreError> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT id, reducer_name, frame_seq, state_data, created_at_ns
             FROM snapshots
             WHERE reducer_name = ?1 AND frame_seq <= ?2
             ORDER BY frame_seq DESC
             LIMIT 1",
        )?;

        stmt.query_row(params![reducer_name, frame_seq], row_to_snapshot)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => SnapshotStoreError::NotFound {
                    reducer_name: reducer_name.to_string(),
                },
                other => SnapshotStoreError::Database(other),
            })
    }

    /// Lists all snapshots for a reducer, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list(&self, reducer_name: &str) -> Result<Vec<Snapshot>, SnapshotStoreError> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT id, reducer_name, frame_seq, state_data, created_at_ns
             FROM snapshots
             WHERE reducer_name = ?1
             ORDER BY frame_seq DESC",
        )?;

        let snapshots = stmt
            .query_map(params![reducer_name], row_to_snapshot)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(snapshots)
    }

    /// Deletes snapshots older than a sequence position.
    ///
    /// Only snapshots are pruned here; ledger events are never touched.
    ///
    /// # Errors
    ///
    /// Returns an error if the deletion fails.
    pub fn prune(
        &self,
        reducer_name: &str,
        keep_after_frame_seq: u64,
    ) -> Result<usize, SnapshotStoreError> {
        let conn = self.conn.lock().unwrap();

        let deleted = conn.execute(
            "DELETE FROM snapshots WHERE reducer_name = ?1 AND frame_seq < ?2",
            params![reducer_name, keep_after_frame_seq],
        )?;

        Ok(deleted)
    }

    /// Checks whether any snapshot exists for a reducer.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn exists(&self, reducer_name: &str) -> Result<bool, SnapshotStoreError> {
        let conn = self.conn.lock().unwrap();

        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM snapshots WHERE reducer_name = ?1 LIMIT 1",
                params![reducer_name],
                |row| row.get(0),
            )
            .optional()?;

        Ok(exists.is_some())
    }
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> Result<Snapshot, rusqlite::Error> {
    Ok(Snapshot {
        id: Some(row.get::<_, i64>(0)? as u64),
        reducer_name: row.get(1)?,
        frame_seq: row.get::<_, i64>(2)? as u64,
        state_data: row.get(3)?,
        created_at_ns: row.get::<_, i64>(4)? as u64,
    })
}
