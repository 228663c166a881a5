//! Per-subscriber connection state machine.
//!
//! Transitions, with everything else rejected:
//!
//! ```text
//! Connecting --handshake_success--> Open
//! Open       --heartbeat_missed---> Retry
//! Retry      --resume-------------> Open
//! Retry      --max_retries--------> Closed   (terminal)
//! ```
//!
//! While not `Open`, frames buffer up to a bounded capacity; overflow drops
//! the oldest buffered frame and counts the loss. A subscriber never sees
//! silently stale data: missed delivery shows up as `Retry`, exhaustion as
//! `Closed`.

use std::collections::VecDeque;

use tracing::warn;

use super::ChannelFrame;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Subscribed, handshake not yet completed.
    Connecting,
    /// Live; frames are pushed as produced.
    Open,
    /// Delivery interrupted; frames buffer while the subscriber recovers.
    Retry,
    /// Terminal. The connection is discarded; a new subscription must
    /// restart from `Connecting`.
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Retry => "retry",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One subscriber's session state.
#[derive(Debug)]
pub struct Connection {
    state: ConnectionState,
    missed_heartbeats: u32,
    retry_count: u32,
    buffered: VecDeque<ChannelFrame>,
    buffer_capacity: usize,
    dropped_frames: u64,
}

impl Connection {
    /// Creates a connection in `Connecting` with the given retry buffer
    /// capacity.
    #[must_use]
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            state: ConnectionState::Connecting,
            missed_heartbeats: 0,
            retry_count: 0,
            buffered: VecDeque::with_capacity(buffer_capacity.min(64)),
            buffer_capacity,
            dropped_frames: 0,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive heartbeat sweeps without a sign of life.
    #[must_use]
    pub const fn missed_heartbeats(&self) -> u32 {
        self.missed_heartbeats
    }

    /// Heartbeat sweeps spent in `Retry` since the last `Open`.
    #[must_use]
    pub const fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Frames lost to buffer overflow since the connection was created.
    #[must_use]
    pub const fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// Number of frames currently buffered.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// `Connecting -> Open`.
    ///
    /// Returns `false` (no transition) from any other state.
    pub fn handshake_success(&mut self) -> bool {
        match self.state {
            ConnectionState::Connecting => {
                self.state = ConnectionState::Open;
                true
            },
            ConnectionState::Open | ConnectionState::Retry | ConnectionState::Closed => false,
        }
    }

    /// Records a sign of life from the subscriber.
    pub fn mark_alive(&mut self) {
        if self.state == ConnectionState::Open {
            self.missed_heartbeats = 0;
        }
    }

    /// `Open -> Retry` on a missed heartbeat or failed delivery.
    ///
    /// Returns `true` if the transition happened.
    pub fn heartbeat_missed(&mut self) -> bool {
        match self.state {
            ConnectionState::Open => {
                self.missed_heartbeats += 1;
                self.retry_count = 0;
                self.state = ConnectionState::Retry;
                true
            },
            ConnectionState::Connecting | ConnectionState::Retry | ConnectionState::Closed => {
                false
            },
        }
    }

    /// One heartbeat sweep spent in `Retry`.
    ///
    /// Transitions to `Closed` once `max_retries` is exceeded; returns the
    /// resulting state.
    pub fn retry_elapsed(&mut self, max_retries: u32) -> ConnectionState {
        if self.state == ConnectionState::Retry {
            self.retry_count += 1;
            if self.retry_count > max_retries {
                self.close();
            }
        }
        self.state
    }

    /// `Retry -> Open` after buffered frames were flushed.
    ///
    /// Returns `false` (no transition) from any other state.
    pub fn reopen(&mut self) -> bool {
        match self.state {
            ConnectionState::Retry => {
                self.state = ConnectionState::Open;
                self.missed_heartbeats = 0;
                self.retry_count = 0;
                true
            },
            ConnectionState::Connecting | ConnectionState::Open | ConnectionState::Closed => false,
        }
    }

    /// Terminal transition; valid from every state.
    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
        self.buffered.clear();
    }

    /// Buffers a frame while the connection is not deliverable.
    ///
    /// On overflow the oldest buffered frame is dropped. That loss boundary
    /// is deliberate and counted, never silent.
    pub fn buffer(&mut self, frame: ChannelFrame) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if self.buffered.len() == self.buffer_capacity {
            if let Some(dropped) = self.buffered.pop_front() {
                self.dropped_frames += 1;
                warn!(
                    channel = %dropped.channel,
                    seq = dropped.seq,
                    total_dropped = self.dropped_frames,
                    "retry buffer full, dropped oldest frame"
                );
            }
        }
        self.buffered.push_back(frame);
    }

    /// Takes the oldest buffered frame.
    pub fn pop_buffered(&mut self) -> Option<ChannelFrame> {
        self.buffered.pop_front()
    }

    /// Returns a frame to the front of the buffer after a failed flush.
    pub fn unpop_buffered(&mut self, frame: ChannelFrame) {
        self.buffered.push_front(frame);
    }
}
