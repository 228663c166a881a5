//! Channel dispatcher: fanout of computed frames to subscribers.
//!
//! Frames are published over three logical channels (`energy`, `experience`,
//! `council`). Each subscriber holds one [`Connection`] state machine and a
//! bounded delivery queue; the dispatcher pushes with `try_send` and never
//! awaits, so delivery is fire-and-forget relative to the frame tick.
//!
//! # Ordering
//!
//! Per channel, frames are delivered in strictly increasing `seq` order. A
//! frame arriving out of order at the dispatcher is dropped with a warning
//! rather than delivered out of order; a connection's retry buffer preserves
//! FIFO order, so the guarantee holds across one `Retry`/resume cycle.
//!
//! # Wire Format
//!
//! The outbound message is JSON with exactly three required fields:
//!
//! ```json
//! { "channel": "energy", "ts": 1.25, "payload": { ... } }
//! ```

mod connection;

pub use connection::{Connection, ConnectionState};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use wirthforge_core::config::PipelineConfig;
use wirthforge_core::events::EnergyEvent;

/// Capacity of each subscriber's delivery queue.
///
/// Small on purpose: a subscriber that falls a full queue behind is treated
/// as a missed delivery and moved to `Retry`, where the larger retry buffer
/// takes over.
const DELIVERY_QUEUE_CAPACITY: usize = 64;

/// The three logical delivery channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Per-token energy frames.
    Energy,
    /// Session lifecycle and experience progression.
    Experience,
    /// Coordination and diagnostic traffic.
    Council,
}

impl Channel {
    /// All channels, in routing-table order.
    pub const ALL: [Self; 3] = [Self::Energy, Self::Experience, Self::Council];

    /// The channel's wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Energy => "energy",
            Self::Experience => "experience",
            Self::Council => "council",
        }
    }

    /// Routes an event kind tag to its channel.
    ///
    /// Token-level energy goes to `energy`, session lifecycle to
    /// `experience`, and everything else (diagnostics included) to
    /// `council`.
    #[must_use]
    pub fn route(kind: &str) -> Self {
        if kind.starts_with("token.") {
            Self::Energy
        } else if kind.starts_with("session.") {
            Self::Experience
        } else {
            Self::Council
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Energy => 0,
            Self::Experience => 1,
            Self::Council => 2,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outbound wire message. All three fields are required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WireMessage {
    /// Delivery channel.
    pub channel: Channel,
    /// Frame time in seconds since session start.
    pub ts: f64,
    /// Structured frame payload.
    pub payload: Value,
}

/// One deliverable frame, derived from one energy event plus routing.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelFrame {
    /// Delivery channel.
    pub channel: Channel,
    /// Sequence number of the originating event.
    pub seq: u64,
    /// Frame time of the originating event.
    pub ts: f64,
    /// Structured frame payload.
    pub payload: Value,
}

impl ChannelFrame {
    /// Builds the frame for an energy event.
    ///
    /// # Errors
    ///
    /// Returns an error if the event payload fails to serialize.
    pub fn from_event(event: &EnergyEvent) -> serde_json::Result<Self> {
        Ok(Self {
            channel: Channel::route(event.kind()),
            seq: event.seq,
            ts: event.frame_time,
            payload: serde_json::json!({
                "type": event.kind(),
                "seq": event.seq,
                "energy": event.energy,
                "detail": event.payload.to_value()?,
            }),
        })
    }

    /// The wire encoding of this frame.
    #[must_use]
    pub fn wire(&self) -> WireMessage {
        WireMessage {
            channel: self.channel,
            ts: self.ts,
            payload: self.payload.clone(),
        }
    }
}

/// Errors from dispatcher operations.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No connection exists for this subscriber.
    #[error("unknown subscriber: {id}")]
    UnknownSubscriber {
        /// The subscriber identifier.
        id: String,
    },

    /// The requested transition is not valid from the current state.
    #[error("invalid transition: {event} from {from}")]
    InvalidTransition {
        /// The state the connection was in.
        from: ConnectionState,
        /// The attempted transition.
        event: &'static str,
    },

    /// Resume could not flush the buffer because the subscriber's queue is
    /// full; the connection stays in `Retry` with its buffer intact.
    #[error("resume stalled for subscriber {id}: delivery queue full")]
    ResumeStalled {
        /// The subscriber identifier.
        id: String,
    },

    /// The subscriber dropped its receiving end; the connection closed.
    #[error("subscriber {id} is gone")]
    SubscriberGone {
        /// The subscriber identifier.
        id: String,
    },
}

/// A subscriber's handle: the delivery queue plus its liveness flag.
pub struct Subscription {
    id: String,
    receiver: mpsc::Receiver<WireMessage>,
    liveness: Arc<AtomicBool>,
}

impl Subscription {
    /// The subscriber identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Signals liveness; call at least once per heartbeat interval.
    pub fn heartbeat(&self) {
        self.liveness.store(true, Ordering::SeqCst);
    }

    /// Receives the next wire message. Returns `None` when the connection
    /// has closed.
    pub async fn recv(&mut self) -> Option<WireMessage> {
        self.receiver.recv().await
    }

    /// Non-blocking receive.
    ///
    /// # Errors
    ///
    /// Propagates the queue's empty/disconnected state.
    pub fn try_recv(&mut self) -> Result<WireMessage, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }
}

/// Dispatcher configuration, lifted from the pipeline config.
#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    /// Missed-heartbeat sweeps tolerated in `Retry` before closing.
    pub max_retries: u32,
    /// Retry buffer capacity per connection.
    pub retry_buffer_capacity: usize,
}

impl From<&PipelineConfig> for DispatchConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_buffer_capacity: config.retry_buffer_capacity,
        }
    }
}

struct ConnectionEntry {
    connection: Connection,
    channels: Vec<Channel>,
    sender: mpsc::Sender<WireMessage>,
    liveness: Arc<AtomicBool>,
}

/// Owns all subscriber connections and routes frames to them.
///
/// The dispatcher reads energy events and serializes them; it never mutates
/// them. All operations are synchronous and non-blocking so they are safe to
/// call from inside a frame tick.
pub struct ChannelDispatcher {
    config: DispatchConfig,
    connections: HashMap<String, ConnectionEntry>,
    last_seq: [u64; 3],
}

impl ChannelDispatcher {
    /// Creates an empty dispatcher.
    #[must_use]
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            config,
            connections: HashMap::new(),
            last_seq: [0; 3],
        }
    }

    /// Registers a subscriber on the given channels.
    ///
    /// The connection starts in `Connecting`; frames buffer until
    /// [`Self::complete_handshake`]. Re-subscribing under an existing id
    /// replaces the old connection.
    pub fn subscribe(&mut self, id: impl Into<String>, channels: &[Channel]) -> Subscription {
        let id = id.into();
        let (sender, receiver) = mpsc::channel(DELIVERY_QUEUE_CAPACITY);
        let liveness = Arc::new(AtomicBool::new(true));

        debug!(subscriber = %id, channels = channels.len(), "subscriber connecting");
        self.connections.insert(
            id.clone(),
            ConnectionEntry {
                connection: Connection::new(self.config.retry_buffer_capacity),
                channels: channels.to_vec(),
                sender,
                liveness: Arc::clone(&liveness),
            },
        );

        Subscription {
            id,
            receiver,
            liveness,
        }
    }

    /// Completes a subscriber's handshake: `Connecting -> Open`, flushing
    /// any frames buffered while connecting.
    ///
    /// # Errors
    ///
    /// [`DispatchError::UnknownSubscriber`] or
    /// [`DispatchError::InvalidTransition`].
    pub fn complete_handshake(&mut self, id: &str) -> Result<(), DispatchError> {
        let entry =
            self.connections
                .get_mut(id)
                .ok_or_else(|| DispatchError::UnknownSubscriber {
                    id: id.to_string(),
                })?;

        if !entry.connection.handshake_success() {
            return Err(DispatchError::InvalidTransition {
                from: entry.connection.state(),
                event: "handshake_success",
            });
        }

        debug!(subscriber = %id, "handshake complete");
        Self::flush_buffered(id, entry);
        Ok(())
    }

    /// Routes one frame to every subscriber of its channel.
    ///
    /// Never blocks. An out-of-order frame (stale `seq` for its channel) is
    /// dropped with a warning instead of delivered out of order.
    pub fn dispatch(&mut self, frame: &ChannelFrame) {
        let idx = frame.channel.index();
        if self.last_seq[idx] >= frame.seq {
            warn!(
                channel = %frame.channel,
                seq = frame.seq,
                last = self.last_seq[idx],
                "dropping out-of-order frame"
            );
            return;
        }
        self.last_seq[idx] = frame.seq;

        for (id, entry) in &mut self.connections {
            if !entry.channels.contains(&frame.channel) {
                continue;
            }

            match entry.connection.state() {
                ConnectionState::Open => match entry.sender.try_send(frame.wire()) {
                    Ok(()) => {},
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(subscriber = %id, seq = frame.seq, "delivery queue full, retrying");
                        entry.connection.heartbeat_missed();
                        entry.connection.buffer(frame.clone());
                    },
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        warn!(subscriber = %id, "subscriber gone, closing connection");
                        entry.connection.close();
                    },
                },
                ConnectionState::Connecting | ConnectionState::Retry => {
                    entry.connection.buffer(frame.clone());
                },
                ConnectionState::Closed => {},
            }
        }

        self.discard_closed();
    }

    /// One heartbeat sweep, driven by the scheduler's clock.
    ///
    /// Open connections that showed no liveness since the last sweep move to
    /// `Retry`; retrying connections consume one retry and close once
    /// `max_retries` is exceeded.
    pub fn on_heartbeat_tick(&mut self) {
        let max_retries = self.config.max_retries;

        for (id, entry) in &mut self.connections {
            match entry.connection.state() {
                ConnectionState::Open => {
                    if entry.liveness.swap(false, Ordering::SeqCst) {
                        entry.connection.mark_alive();
                    } else {
                        warn!(subscriber = %id, "heartbeat missed");
                        entry.connection.heartbeat_missed();
                    }
                },
                ConnectionState::Retry => {
                    let state = entry.connection.retry_elapsed(max_retries);
                    if state == ConnectionState::Closed {
                        warn!(
                            subscriber = %id,
                            retries = entry.connection.retry_count(),
                            "max retries exceeded, closing connection"
                        );
                    }
                },
                ConnectionState::Connecting | ConnectionState::Closed => {},
            }
        }

        self.discard_closed();
    }

    /// Resumes a retrying subscriber: flushes its buffer in order, then
    /// `Retry -> Open`.
    ///
    /// # Errors
    ///
    /// [`DispatchError::ResumeStalled`] if the delivery queue cannot take
    /// the whole buffer (connection stays in `Retry`, nothing lost);
    /// [`DispatchError::SubscriberGone`] if the receiver was dropped;
    /// [`DispatchError::InvalidTransition`] outside `Retry`.
    pub fn resume(&mut self, id: &str) -> Result<(), DispatchError> {
        let result = self.resume_inner(id);
        self.discard_closed();
        result
    }

    fn resume_inner(&mut self, id: &str) -> Result<(), DispatchError> {
        let entry =
            self.connections
                .get_mut(id)
                .ok_or_else(|| DispatchError::UnknownSubscriber {
                    id: id.to_string(),
                })?;

        if entry.connection.state() != ConnectionState::Retry {
            return Err(DispatchError::InvalidTransition {
                from: entry.connection.state(),
                event: "resume",
            });
        }

        while let Some(frame) = entry.connection.pop_buffered() {
            match entry.sender.try_send(frame.wire()) {
                Ok(()) => {},
                Err(mpsc::error::TrySendError::Full(_)) => {
                    entry.connection.unpop_buffered(frame);
                    return Err(DispatchError::ResumeStalled { id: id.to_string() });
                },
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    entry.connection.close();
                    return Err(DispatchError::SubscriberGone { id: id.to_string() });
                },
            }
        }

        entry.connection.reopen();
        entry.liveness.store(true, Ordering::SeqCst);
        debug!(subscriber = %id, "connection resumed");
        Ok(())
    }

    /// The state of a subscriber's connection, if it exists.
    #[must_use]
    pub fn connection_state(&self, id: &str) -> Option<ConnectionState> {
        self.connections.get(id).map(|e| e.connection.state())
    }

    /// Number of live (non-closed) connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn flush_buffered(id: &str, entry: &mut ConnectionEntry) {
        while let Some(frame) = entry.connection.pop_buffered() {
            match entry.sender.try_send(frame.wire()) {
                Ok(()) => {},
                Err(mpsc::error::TrySendError::Full(_)) => {
                    entry.connection.unpop_buffered(frame);
                    break;
                },
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!(subscriber = %id, "subscriber gone during flush");
                    entry.connection.close();
                    break;
                },
            }
        }
    }

    fn discard_closed(&mut self) {
        self.connections
            .retain(|_, entry| entry.connection.state() != ConnectionState::Closed);
    }
}
