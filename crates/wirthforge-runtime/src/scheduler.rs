//! The frame scheduler: one logical clock driving the pipeline at 60 Hz.
//!
//! Each tick drains pending token samples, computes energy, appends events to
//! the ledger, and hands frames to the dispatcher. Nothing inside a tick
//! blocks: delivery is `try_send`, the only suspension point is the durable
//! append, and work that exceeds the per-tick budget waits for the next tick.
//!
//! # Backpressure and Degraded Mode
//!
//! The pending queue absorbs bursts. Above the configured shed threshold the
//! scheduler enters degraded mode: it drops the least-recent pending samples,
//! appends a `frame.shed` diagnostic event, and keeps the clock honest
//! instead of stretching the tick.
//!
//! # Cancellation
//!
//! Shutdown finishes the in-flight tick, appends the session-end event,
//! attempts one final snapshot, then halts. No partial event is ever
//! appended.

use std::collections::VecDeque;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use wirthforge_core::config::PipelineConfig;
use wirthforge_core::energy::EnergyFunction;
use wirthforge_core::events::{EnergyEvent, EventPayload, FrameShedPayload};
use wirthforge_core::ledger::{LedgerError, LedgerWriter};
use wirthforge_core::reducer::EnergyAggregateReducer;
use wirthforge_core::signal::{SignalExtractor, TokenSample};
use wirthforge_core::snapshot::{SnapshotError, SnapshotManager};

use crate::clock::SessionClock;
use crate::dispatch::{ChannelDispatcher, ChannelFrame};

/// Errors that halt the frame loop.
///
/// Per-measurement errors and snapshot fold failures are isolated inside the
/// tick; what escapes here threatens the durability guarantee.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SchedulerError {
    /// The ledger rejected an append. A sequence conflict here is fatal and
    /// must surface to the operator, never be renumbered away.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Scheduler lifecycle state, observable between ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Between ticks.
    Idle,
    /// Inside a tick.
    Ticking,
}

/// Control messages processed at the top of each tick.
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Resume a retrying subscriber.
    Resume {
        /// The subscriber identifier.
        subscriber: String,
    },
}

/// Accounting for one tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickReport {
    /// Frame time at the start of the tick.
    pub frame_time: f64,
    /// Token events appended this tick.
    pub appended: u64,
    /// Measurements rejected as invalid this tick.
    pub invalid: u64,
    /// Samples shed this tick.
    pub shed: u64,
    /// Samples still pending after the tick.
    pub pending: usize,
    /// Whether a snapshot was written this tick.
    pub snapshot_taken: bool,
    /// Whether the scheduler is in degraded mode.
    pub degraded: bool,
}

/// Drives the pipeline at a fixed frame cadence.
pub struct FrameScheduler<C: SessionClock> {
    clock: C,
    extractor: SignalExtractor,
    energy: EnergyFunction,
    writer: LedgerWriter,
    snapshots: SnapshotManager<EnergyAggregateReducer>,
    dispatcher: ChannelDispatcher,
    ingress: mpsc::Receiver<TokenSample>,
    commands: mpsc::Receiver<SchedulerCommand>,
    pending: VecDeque<TokenSample>,
    state: SchedulerState,
    degraded: bool,

    frame_interval: Duration,
    max_samples_per_tick: usize,
    shed_threshold: usize,
    heartbeat_period_s: f64,
    snapshot_period_s: f64,
    next_heartbeat_at: f64,
    next_snapshot_at: f64,

    ticks: u64,
    shed_total: u64,
    invalid_total: u64,
}

impl<C: SessionClock> FrameScheduler<C> {
    /// Creates a scheduler over already-wired components.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &PipelineConfig,
        clock: C,
        writer: LedgerWriter,
        snapshots: SnapshotManager<EnergyAggregateReducer>,
        dispatcher: ChannelDispatcher,
        ingress: mpsc::Receiver<TokenSample>,
        commands: mpsc::Receiver<SchedulerCommand>,
    ) -> Self {
        let heartbeat_period_s = config.heartbeat_interval_ms as f64 / 1000.0;
        let snapshot_period_s = config.snapshot_period_ms as f64 / 1000.0;

        Self {
            clock,
            extractor: SignalExtractor::new(config.nominal_token_gap_ms, config.frame_interval_ms),
            energy: EnergyFunction::new(config.weights),
            writer,
            snapshots,
            dispatcher,
            ingress,
            commands,
            pending: VecDeque::new(),
            state: SchedulerState::Idle,
            degraded: false,
            frame_interval: Duration::from_secs_f64(config.frame_interval_ms / 1000.0),
            max_samples_per_tick: config.max_samples_per_tick,
            shed_threshold: config.pending_shed_threshold,
            heartbeat_period_s,
            snapshot_period_s,
            next_heartbeat_at: heartbeat_period_s,
            next_snapshot_at: snapshot_period_s,
            ticks: 0,
            shed_total: 0,
            invalid_total: 0,
        }
    }

    /// The dispatcher, for establishing subscriptions before the loop runs.
    pub fn dispatcher_mut(&mut self) -> &mut ChannelDispatcher {
        &mut self.dispatcher
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SchedulerState {
        self.state
    }

    /// Whether the scheduler is currently shedding to hold the frame budget.
    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Appends the session-start event.
    ///
    /// # Errors
    ///
    /// Returns an error if the append fails.
    pub fn begin_session(&mut self) -> Result<(), SchedulerError> {
        let frame_time = self.clock.frame_time();
        let event = self
            .writer
            .append(frame_time, 0.0, EventPayload::SessionStart)?;
        self.dispatch_event(&event);
        info!(frame_time, "session started");
        Ok(())
    }

    /// Executes one frame tick.
    ///
    /// # Errors
    ///
    /// Returns an error only for ledger failures; per-measurement and
    /// snapshot-fold errors are isolated and logged.
    pub fn tick(&mut self) -> Result<TickReport, SchedulerError> {
        self.state = SchedulerState::Ticking;
        let result = self.tick_inner();
        self.state = SchedulerState::Idle;
        result
    }

    fn tick_inner(&mut self) -> Result<TickReport, SchedulerError> {
        let frame_time = self.clock.frame_time();

        self.drain_commands();
        while let Ok(sample) = self.ingress.try_recv() {
            self.pending.push_back(sample);
        }

        let shed = self.shed_excess(frame_time)?;

        let mut appended = 0u64;
        let mut invalid = 0u64;
        let budget = self.max_samples_per_tick.min(self.pending.len());
        for _ in 0..budget {
            let Some(sample) = self.pending.pop_front() else {
                break;
            };
            let measurement = self.extractor.extract(&sample);
            match self.energy.compute(&measurement) {
                Ok(computed) => {
                    let event = self.writer.append(
                        frame_time,
                        computed.energy,
                        EventPayload::TokenEnergy(computed.details),
                    )?;
                    self.dispatch_event(&event);
                    appended += 1;
                },
                Err(e) => {
                    // One bad measurement never aborts the stream.
                    invalid += 1;
                    self.invalid_total += 1;
                    warn!(error = %e, "rejecting measurement");
                },
            }
        }

        if frame_time >= self.next_heartbeat_at {
            self.dispatcher.on_heartbeat_tick();
            self.next_heartbeat_at = frame_time + self.heartbeat_period_s;
        }

        let mut snapshot_taken = false;
        if frame_time >= self.next_snapshot_at {
            snapshot_taken = self.take_snapshot();
            self.next_snapshot_at = frame_time + self.snapshot_period_s;
        }

        self.ticks += 1;
        let report = TickReport {
            frame_time,
            appended,
            invalid,
            shed,
            pending: self.pending.len(),
            snapshot_taken,
            degraded: self.degraded,
        };
        trace!(
            frame_time,
            appended,
            pending = report.pending,
            "tick complete"
        );
        Ok(report)
    }

    /// Finishes the session: one draining tick, the session-end event, and a
    /// final snapshot attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if an append fails.
    pub fn end_session(&mut self) -> Result<(), SchedulerError> {
        self.tick()?;

        let frame_time = self.clock.frame_time();
        let event = self
            .writer
            .append(frame_time, 0.0, EventPayload::SessionEnd)?;
        self.dispatch_event(&event);

        if let Err(e) = self.snapshots.snapshot() {
            warn!(error = %e, "final snapshot failed");
        }
        info!(
            frame_time,
            ticks = self.ticks,
            shed = self.shed_total,
            invalid = self.invalid_total,
            "session ended"
        );
        Ok(())
    }

    /// Runs the frame loop until shutdown is signalled.
    ///
    /// The in-flight tick always completes; shutdown then runs the session
    /// teardown and returns.
    ///
    /// # Errors
    ///
    /// Returns the first ledger failure encountered.
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), SchedulerError> {
        self.begin_session()?;

        let mut interval = tokio::time::interval(self.frame_interval);
        // A late tick is caught up by shedding, never by bursting.
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick()?;
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                },
            }
        }

        self.end_session()
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                SchedulerCommand::Resume { subscriber } => {
                    if let Err(e) = self.dispatcher.resume(&subscriber) {
                        warn!(subscriber = %subscriber, error = %e, "resume failed");
                    }
                },
            }
        }
    }

    fn shed_excess(&mut self, frame_time: f64) -> Result<u64, SchedulerError> {
        let mut shed = 0u64;
        while self.pending.len() > self.shed_threshold {
            self.pending.pop_front();
            shed += 1;
        }

        if shed > 0 {
            self.shed_total += shed;
            if !self.degraded {
                self.degraded = true;
                error!(
                    shed,
                    pending = self.pending.len(),
                    "frame budget exceeded, entering degraded mode"
                );
            }
            let event = self.writer.append(
                frame_time,
                0.0,
                EventPayload::FrameShed(FrameShedPayload {
                    dropped: shed,
                    pending: self.pending.len() as u64,
                }),
            )?;
            self.dispatch_event(&event);
        } else if self.degraded && self.pending.len() <= self.shed_threshold / 2 {
            self.degraded = false;
            info!(pending = self.pending.len(), "leaving degraded mode");
        }

        Ok(shed)
    }

    fn take_snapshot(&mut self) -> bool {
        match self.snapshots.snapshot() {
            Ok(snapshot) => {
                debug!(frame_seq = snapshot.frame_seq, "snapshot written");
                true
            },
            Err(SnapshotError::FoldFailure { seq, source }) => {
                // Recoverable: the partial fold was discarded and the last
                // good snapshot retained.
                warn!(seq, error = %source, "snapshot fold failed");
                false
            },
            Err(e) => {
                // Storage trouble threatens the restart path; shout, but the
                // frame loop keeps running.
                error!(error = %e, "snapshot storage failure");
                false
            },
        }
    }

    fn dispatch_event(&mut self, event: &EnergyEvent) {
        match ChannelFrame::from_event(event) {
            Ok(frame) => self.dispatcher.dispatch(&frame),
            Err(e) => {
                // The payload serialized during append; failing here would
                // mean a non-serializable value slipped in between.
                debug!(seq = event.seq, error = %e, "frame serialization failed");
            },
        }
    }
}
