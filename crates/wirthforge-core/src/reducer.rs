//! Deterministic fold framework over ledger events.
//!
//! A reducer transforms the event stream into derived state. Reducers must be
//! deterministic: folding the same event range from the same starting state
//! always yields the same result, byte-for-byte once serialized. The snapshot
//! manager relies on this to make snapshot-plus-tail replay equivalent to
//! replay from genesis.

use serde::{Deserialize, Serialize};

use crate::events::{EnergyEvent, EventPayload};

/// A deterministic fold over energy events.
///
/// Implementations must not consult wall-clock time, randomness, or any input
/// other than the events themselves and their own state.
pub trait Reducer {
    /// The derived state this reducer maintains.
    type State: Serialize + serde::de::DeserializeOwned;

    /// Error type for event application.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Stable name, used to key persisted snapshots.
    fn name(&self) -> &'static str;

    /// Folds one event into the state.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be applied; the caller discards
    /// the partial fold.
    fn apply(&mut self, event: &EnergyEvent) -> Result<(), Self::Error>;

    /// The current state.
    fn state(&self) -> &Self::State;

    /// Replaces the state wholesale (checkpoint restore).
    fn restore(&mut self, state: Self::State);

    /// Resets to the empty state.
    fn reset(&mut self);

    /// Serializes the current state canonically.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    fn serialize_state(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self.state())
    }

    /// Restores state from its serialized form.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes do not deserialize to `State`.
    fn deserialize_state(&mut self, bytes: &[u8]) -> serde_json::Result<()> {
        self.restore(serde_json::from_slice(bytes)?);
        Ok(())
    }
}

/// Aggregate state folded from the energy event stream.
///
/// `kind_counts` stays sorted by kind tag so serialized state compares
/// byte-identical across replays.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyAggregate {
    /// Total events folded.
    pub event_count: u64,

    /// Sum of all event energies.
    pub cumulative_energy: f64,

    /// Highest single-event energy seen.
    pub peak_energy: f64,

    /// Frame time of the last folded event.
    pub last_frame_time: f64,

    /// Events shed by the scheduler, from `frame.shed` diagnostics.
    pub shed_total: u64,

    /// Event counts per kind tag, sorted by tag.
    pub kind_counts: Vec<(String, u64)>,
}

impl EnergyAggregate {
    fn increment_kind(&mut self, tag: &str) {
        for (kind, count) in &mut self.kind_counts {
            if kind == tag {
                *count += 1;
                return;
            }
        }
        self.kind_counts.push((tag.to_string(), 1));
        self.kind_counts.sort_by(|a, b| a.0.cmp(&b.0));
    }
}

/// The canonical aggregate reducer used by the snapshot manager.
#[derive(Debug, Default)]
pub struct EnergyAggregateReducer {
    state: EnergyAggregate,
}

impl Reducer for EnergyAggregateReducer {
    type State = EnergyAggregate;
    type Error = std::convert::Infallible;

    fn name(&self) -> &'static str {
        "energy-aggregate"
    }

    fn apply(&mut self, event: &EnergyEvent) -> Result<(), Self::Error> {
        self.state.event_count += 1;
        self.state.cumulative_energy += event.energy;
        if event.energy > self.state.peak_energy {
            self.state.peak_energy = event.energy;
        }
        self.state.last_frame_time = event.frame_time;
        self.state.increment_kind(event.kind());

        if let EventPayload::FrameShed(shed) = &event.payload {
            self.state.shed_total += shed.dropped;
        }

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
