//! wirthforge-runtime - WIRTHFORGE energy pipeline runtime
//!
//! This crate drives the core at frame cadence and delivers computed frames
//! to subscribers. One cooperative tokio task runs the 60 Hz tick loop; the
//! tick never awaits delivery, and work that cannot complete within a frame
//! is deferred or shed rather than stalling the clock.
//!
//! # Architecture
//!
//! ```text
//! TokenSample --> ingress queue --> FrameScheduler (16.67 ms tick)
//!                                      |        \
//!                                LedgerWriter    ChannelDispatcher
//!                                (durability)    (energy/experience/council)
//!                                      |                 |
//!                               SnapshotManager     Subscriptions
//!                               (periodic fold)     (bounded queues)
//! ```
//!
//! # Modules
//!
//! - [`clock`]: Injectable session clock so tests drive frame time
//!   deterministically
//! - [`dispatch`]: Channel dispatcher, connection state machines, and the
//!   JSON wire format
//! - [`scheduler`]: The frame scheduler with backpressure and degraded mode
//! - [`pipeline`]: Assembly of the core and runtime into one running session

pub mod clock;
pub mod dispatch;
pub mod pipeline;
pub mod scheduler;

pub use clock::{ManualClock, MonotonicClock, SessionClock};
pub use dispatch::{
    Channel, ChannelDispatcher, ChannelFrame, ConnectionState, DispatchError, Subscription,
    WireMessage,
};
pub use pipeline::{BuildError, IngestError, Pipeline, PipelineHandle};
pub use scheduler::{FrameScheduler, SchedulerError, SchedulerState, TickReport};
