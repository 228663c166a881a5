//! The durable energy event record and its typed payload envelope.
//!
//! Every computed energy value becomes one [`EnergyEvent`] in the ledger.
//! Events are immutable once appended and totally ordered by a gapless `seq`.
//!
//! # Payload Envelope
//!
//! `payload` is a tagged union keyed by the event kind string, so structured
//! validation works without reflection. Kinds this crate does not know about
//! round-trip through [`EventPayload::Raw`] so replay tools never fail on
//! data written by a newer producer.
//!
//! # Persisted Encoding
//!
//! `frame_time` and `energy` are top-level fields of the persisted event,
//! sibling to `payload`:
//!
//! ```json
//! { "seq": 42, "type": "token.energy", "frame_time": 1.25,
//!   "energy": 0.83, "payload": { ... } }
//! ```
//!
//! They are never duplicated inside `payload`; the typed payload variants
//! have no frame-time or energy fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::energy::EnergyDetails;

/// Event kind tags.
pub mod kind {
    /// Per-token computed energy.
    pub const TOKEN_ENERGY: &str = "token.energy";

    /// Diagnostic emitted when the scheduler sheds pending work.
    pub const FRAME_SHED: &str = "frame.shed";

    /// Session opened.
    pub const SESSION_START: &str = "session.start";

    /// Session closed.
    pub const SESSION_END: &str = "session.end";
}

/// Detail payload for a shed diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameShedPayload {
    /// Samples dropped from the front of the pending queue.
    pub dropped: u64,

    /// Samples still pending after shedding.
    pub pending: u64,
}

/// Typed payload envelope, keyed by the event kind tag.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// Components of one computed energy value.
    TokenEnergy(EnergyDetails),

    /// The scheduler shed pending work to hold the frame budget.
    FrameShed(FrameShedPayload),

    /// Session opened.
    SessionStart,

    /// Session closed.
    SessionEnd,

    /// A kind this build does not know. Preserved verbatim for replay.
    Raw {
        /// The unrecognized kind tag.
        kind: String,
        /// The payload object as written.
        value: Value,
    },
}

impl EventPayload {
    /// The kind tag this payload serializes under.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::TokenEnergy(_) => kind::TOKEN_ENERGY,
            Self::FrameShed(_) => kind::FRAME_SHED,
            Self::SessionStart => kind::SESSION_START,
            Self::SessionEnd => kind::SESSION_END,
            Self::Raw { kind, .. } => kind,
        }
    }

    /// Serializes the payload body to a JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_value(&self) -> serde_json::Result<Value> {
        match self {
            Self::TokenEnergy(details) => serde_json::to_value(details),
            Self::FrameShed(shed) => serde_json::to_value(shed),
            Self::SessionStart | Self::SessionEnd => Ok(Value::Object(serde_json::Map::new())),
            Self::Raw { value, .. } => Ok(value.clone()),
        }
    }

    /// Reassembles a payload from its persisted kind tag and JSON body.
    ///
    /// Unknown kinds become [`EventPayload::Raw`].
    ///
    /// # Errors
    ///
    /// Returns an error if a known kind's body does not match its schema.
    pub fn from_parts(kind_tag: &str, value: Value) -> serde_json::Result<Self> {
        match kind_tag {
            kind::TOKEN_ENERGY => Ok(Self::TokenEnergy(serde_json::from_value(value)?)),
            kind::FRAME_SHED => Ok(Self::FrameShed(serde_json::from_value(value)?)),
            kind::SESSION_START => Ok(Self::SessionStart),
            kind::SESSION_END => Ok(Self::SessionEnd),
            other => Ok(Self::Raw {
                kind: other.to_string(),
                value,
            }),
        }
    }
}

/// One durable event in the energy ledger.
///
/// Constructed only by the ledger writer, which assigns `seq`.
#[derive(Debug, Clone, PartialEq)]
pub struct EnergyEvent {
    /// Gapless monotonic sequence number, starting at 1.
    pub seq: u64,

    /// Seconds since session start.
    pub frame_time: f64,

    /// Normalized energy, `[0, 1]`.
    pub energy: f64,

    /// Typed detail payload.
    pub payload: EventPayload,
}

impl EnergyEvent {
    /// The event kind tag.
    #[must_use]
    pub fn kind(&self) -> &str {
        self.payload.kind()
    }

    /// Serializes the event in the persisted JSON encoding.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload fails to serialize.
    pub fn to_json(&self) -> serde_json::Result<Value> {
        Ok(serde_json::json!({
            "seq": self.seq,
            "type": self.kind(),
            "frame_time": self.frame_time,
            "energy": self.energy,
            "payload": self.payload.to_value()?,
        }))
    }
}
