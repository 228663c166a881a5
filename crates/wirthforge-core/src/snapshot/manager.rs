//! The snapshot manager: periodic incremental folds of the ledger.
//!
//! Each [`SnapshotManager::snapshot`] call restores the reducer from the
//! latest stored snapshot, folds the tail of the ledger up to the head
//! captured at the start of the call, and writes one superseding snapshot.
//! A reducer failure discards the partial fold; the last good snapshot is
//! never replaced by a partial one.

use tracing::{debug, warn};

use super::store::{Snapshot, SnapshotStore, SnapshotStoreError};
use crate::ledger::{EventLedger, LedgerError};
use crate::reducer::Reducer;

/// Batch size for reading ledger events during a fold.
const FOLD_BATCH_SIZE: u64 = 512;

/// Errors that can occur while producing a snapshot.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// Error reading the ledger.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Error from snapshot storage.
    #[error("snapshot store error: {0}")]
    Store(#[from] SnapshotStoreError),

    /// Error serializing reducer state.
    #[error("state serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The reducer failed mid-fold. The partial result was discarded and the
    /// previous snapshot retained.
    #[error("fold failed at seq={seq}: {source}")]
    FoldFailure {
        /// Sequence number of the event that failed to apply.
        seq: u64,
        /// The reducer's error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Produces snapshots by folding ledger events through a reducer.
///
/// Owns the reducer and reads the ledger; never writes to it.
pub struct SnapshotManager<R: Reducer> {
    ledger: EventLedger,
    store: SnapshotStore,
    reducer: R,
}

impl<R: Reducer> SnapshotManager<R> {
    /// Creates a snapshot manager.
    pub const fn new(ledger: EventLedger, store: SnapshotStore, reducer: R) -> Self {
        Self {
            ledger,
            store,
            reducer,
        }
    }

    /// Produces a snapshot covering the ledger up to its current head.
    ///
    /// The head is captured once at the start, so the fold operates on a
    /// fixed, bounded range even while the writer keeps appending. If no new
    /// events exist the latest snapshot is returned unchanged.
    ///
    /// # Errors
    ///
    /// [`SnapshotError::FoldFailure`] if the reducer rejects an event (the
    /// previous snapshot is retained); ledger/store errors pass through.
    pub fn snapshot(&mut self) -> Result<Snapshot, SnapshotError> {
        let head = self.ledger.head()?;

        let mut cursor = match self.store.load_latest(self.reducer.name()) {
            Ok(snapshot) => {
                if snapshot.frame_seq >= head {
                    debug!(
                        frame_seq = snapshot.frame_seq,
                        "no new events since last snapshot"
                    );
                    return Ok(snapshot);
                }
                self.reducer.deserialize_state(&snapshot.state_data)?;
                snapshot.frame_seq
            },
            Err(SnapshotStoreError::NotFound { .. }) => {
                self.reducer.reset();
                0
            },
            Err(e) => return Err(e.into()),
        };

        let start = cursor;
        while cursor < head {
            let batch = self.ledger.read_from(cursor, FOLD_BATCH_SIZE)?;
            if batch.is_empty() {
                break;
            }

            for event in &batch {
                // The range was fixed at the start of the call.
                if event.seq > head {
                    break;
                }
                self.reducer.apply(event).map_err(|e| {
                    warn!(seq = event.seq, error = %e, "discarding partial fold");
                    SnapshotError::FoldFailure {
                        seq: event.seq,
                        source: Box::new(e),
                    }
                })?;
                cursor = event.seq;
            }
        }

        let state_data = self.reducer.serialize_state()?;
        let mut snapshot = Snapshot::new(self.reducer.name(), cursor, state_data);
        let id = self.store.save(&snapshot)?;
        snapshot.id = Some(id);

        debug!(
            from = start,
            to = cursor,
            "snapshot written"
        );
        Ok(snapshot)
    }

    /// Folds the entire ledger from genesis, ignoring stored snapshots.
    ///
    /// Used to verify replay determinism and to rebuild a lost snapshot
    /// store.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::snapshot`], without touching the store.
    pub fn replay_from_genesis(&mut self) -> Result<Vec<u8>, SnapshotError> {
        let head = self.ledger.head()?;
        self.reducer.reset();

        let mut cursor = 0;
        while cursor < head {
            let batch = self.ledger.read_from(cursor, FOLD_BATCH_SIZE)?;
            if batch.is_empty() {
                break;
            }
            for event in &batch {
                if event.seq > head {
                    break;
                }
                self.reducer
                    .apply(event)
                    .map_err(|e| SnapshotError::FoldFailure {
                        seq: event.seq,
                        source: Box::new(e),
                    })?;
                cursor = event.seq;
            }
        }

        Ok(self.reducer.serialize_state()?)
    }

    /// The latest stored snapshot, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the store query fails.
    pub fn latest(&self) -> Result<Option<Snapshot>, SnapshotError> {
        match self.store.load_latest(self.reducer.name()) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(SnapshotStoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EnergyEvent, EventPayload};
    use crate::reducer::{EnergyAggregate, EnergyAggregateReducer};

    fn setup(events: u64) -> (EventLedger, SnapshotStore) {
        let ledger = EventLedger::in_memory().unwrap();
        let mut writer = ledger.writer().unwrap();
        let items: Vec<_> = (0..events)
            .map(|i| (i as f64 * 0.016, 0.5, EventPayload::SessionStart))
            .collect();
        writer.append_batch(items).unwrap();
        (ledger, SnapshotStore::in_memory().unwrap())
    }

    #[test]
    fn test_snapshot_covers_head() {
        let (ledger, store) = setup(25);
        let mut manager =
            SnapshotManager::new(ledger, store, EnergyAggregateReducer::default());

        let snapshot = manager.snapshot().unwrap();
        assert_eq!(snapshot.frame_seq, 25);

        let state: EnergyAggregate = serde_json::from_slice(&snapshot.state_data).unwrap();
        assert_eq!(state.event_count, 25);
    }

    #[test]
    fn test_incremental_fold_equals_genesis_replay() {
        let (ledger, store) = setup(10);
        let mut manager = SnapshotManager::new(
            ledger.clone(),
            store,
            EnergyAggregateReducer::default(),
        );

        manager.snapshot().unwrap();

        // Append a tail after the first snapshot.
        let mut writer = ledger.writer().unwrap();
        for i in 10..15 {
            writer
                .append(f64::from(i) * 0.016, 0.25, EventPayload::SessionStart)
                .unwrap();
        }

        let incremental = manager.snapshot().unwrap();
        let genesis = manager.replay_from_genesis().unwrap();
        assert_eq!(incremental.state_data, genesis);
        assert_eq!(incremental.frame_seq, 15);
    }

    #[test]
    fn test_no_new_events_returns_latest_unchanged() {
        let (ledger, store) = setup(5);
        let mut manager =
            SnapshotManager::new(ledger, store, EnergyAggregateReducer::default());

        let first = manager.snapshot().unwrap();
        let second = manager.snapshot().unwrap();
        assert_eq!(first.frame_seq, second.frame_seq);
        assert_eq!(first.state_data, second.state_data);
    }

    #[test]
    fn test_fold_failure_retains_previous_snapshot() {
        /// Rejects any event past a fixed sequence number.
        #[derive(Debug, Default)]
        struct FailingReducer {
            state: EnergyAggregate,
            fail_after: u64,
        }

        #[derive(Debug, thiserror::Error)]
        #[error("poisoned event")]
        struct Poisoned;

        impl Reducer for FailingReducer {
            type State = EnergyAggregate;
            type Error = Poisoned;

            fn name(&self) -> &'static str {
                "failing"
            }

            fn apply(&mut self, event: &EnergyEvent) -> Result<(), Self::Error> {
                if event.seq > self.fail_after {
                    return Err(Poisoned);
                }
                self.state.event_count += 1;
                Ok(())
            }

            fn state(&self) -> &Self::State {
                &self.state
            }

            fn restore(&mut self, state: Self::State) {
                self.state = state;
            }

            fn reset(&mut self) {
                self.state = EnergyAggregate::default();
            }
        }

        let (ledger, store) = setup(4);

        let mut manager = SnapshotManager::new(
            ledger.clone(),
            store,
            FailingReducer {
                state: EnergyAggregate::default(),
                fail_after: 10,
            },
        );
        let good = manager.snapshot().unwrap();
        assert_eq!(good.frame_seq, 4);

        // New events beyond the failure point.
        let mut writer = ledger.writer().unwrap();
        for i in 4..12 {
            writer
                .append(f64::from(i) * 0.016, 0.5, EventPayload::SessionStart)
                .unwrap();
        }

        let err = manager.snapshot().unwrap_err();
        assert!(matches!(err, SnapshotError::FoldFailure { seq: 11, .. }));

        // The stored snapshot is still the last good one.
        let latest = manager.latest().unwrap().unwrap();
        assert_eq!(latest.frame_seq, 4);
        assert_eq!(latest.state_data, good.state_data);
    }

    #[test]
    fn test_empty_ledger_snapshot() {
        let ledger = EventLedger::in_memory().unwrap();
        let store = SnapshotStore::in_memory().unwrap();
        let mut manager =
            SnapshotManager::new(ledger, store, EnergyAggregateReducer::default());

        let snapshot = manager.snapshot().unwrap();
        assert_eq!(snapshot.frame_seq, 0);

        let state: EnergyAggregate = serde_json::from_slice(&snapshot.state_data).unwrap();
        assert_eq!(state, EnergyAggregate::default());
    }
}
