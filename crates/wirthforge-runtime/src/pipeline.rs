//! Pipeline assembly: one session's core and runtime wired together.
//!
//! [`Pipeline::build`] validates configuration, takes the ledger's single
//! writer, and wires the extractor, energy function, snapshot manager,
//! dispatcher, and scheduler into one unit. The returned [`PipelineHandle`]
//! is the ingest and control surface: telemetry submission is a non-blocking
//! `try_send`, so a saturated pipeline pushes back at the boundary instead of
//! stalling the producer inside the frame loop.

use thiserror::Error;
use tokio::sync::{mpsc, watch};

use wirthforge_core::config::{ConfigError, PipelineConfig};
use wirthforge_core::ledger::{EventLedger, LedgerError};
use wirthforge_core::reducer::EnergyAggregateReducer;
use wirthforge_core::signal::TokenSample;
use wirthforge_core::snapshot::{SnapshotManager, SnapshotStore};

use crate::clock::{MonotonicClock, SessionClock};
use crate::dispatch::{Channel, ChannelDispatcher, DispatchConfig, DispatchError, Subscription};
use crate::scheduler::{FrameScheduler, SchedulerCommand, SchedulerError};

/// Telemetry samples buffered between producer and frame loop.
const INGRESS_CAPACITY: usize = 4096;

/// Control commands buffered toward the scheduler.
const COMMAND_CAPACITY: usize = 32;

/// Errors from pipeline construction.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The configuration failed validation.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// The ledger writer could not be taken.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Errors from the ingest/control surface.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IngestError {
    /// The ingress queue is full; the sample was not accepted.
    #[error("pipeline ingress saturated")]
    Saturated,

    /// The pipeline has shut down.
    #[error("pipeline is shut down")]
    Closed,
}

/// Ingest and control handle for a running pipeline.
///
/// Cheap to clone; all operations are non-blocking.
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    samples: mpsc::Sender<TokenSample>,
    commands: mpsc::Sender<SchedulerCommand>,
    shutdown: watch::Sender<bool>,
}

impl PipelineHandle {
    /// Submits one token sample for the next tick.
    ///
    /// # Errors
    ///
    /// [`IngestError::Saturated`] if the ingress queue is full,
    /// [`IngestError::Closed`] if the pipeline has shut down.
    pub fn submit(&self, sample: TokenSample) -> Result<(), IngestError> {
        self.samples.try_send(sample).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => IngestError::Saturated,
            mpsc::error::TrySendError::Closed(_) => IngestError::Closed,
        })
    }

    /// Asks the scheduler to resume a retrying subscriber at the next tick.
    ///
    /// # Errors
    ///
    /// [`IngestError::Saturated`] if the command queue is full,
    /// [`IngestError::Closed`] if the pipeline has shut down.
    pub fn resume(&self, subscriber: impl Into<String>) -> Result<(), IngestError> {
        self.commands
            .try_send(SchedulerCommand::Resume {
                subscriber: subscriber.into(),
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => IngestError::Saturated,
                mpsc::error::TrySendError::Closed(_) => IngestError::Closed,
            })
    }

    /// Signals shutdown. The frame loop finishes its in-flight tick, writes
    /// the session-end event, attempts a final snapshot, and returns.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// One session's assembled pipeline.
pub struct Pipeline<C: SessionClock = MonotonicClock> {
    scheduler: FrameScheduler<C>,
    shutdown: watch::Receiver<bool>,
}

impl Pipeline<MonotonicClock> {
    /// Builds a pipeline on the wall clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the ledger's
    /// writer is already taken.
    pub fn build(
        config: &PipelineConfig,
        ledger: EventLedger,
        snapshot_store: SnapshotStore,
    ) -> Result<(Self, PipelineHandle), BuildError> {
        Self::build_with_clock(config, ledger, snapshot_store, MonotonicClock::new())
    }
}

impl<C: SessionClock> Pipeline<C> {
    /// Builds a pipeline on an explicit clock. Tests pass a manual clock and
    /// drive ticks deterministically.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the ledger's
    /// writer is already taken.
    pub fn build_with_clock(
        config: &PipelineConfig,
        ledger: EventLedger,
        snapshot_store: SnapshotStore,
        clock: C,
    ) -> Result<(Self, PipelineHandle), BuildError> {
        config.validate()?;

        let writer = ledger.writer()?;
        let snapshots = SnapshotManager::new(
            ledger,
            snapshot_store,
            EnergyAggregateReducer::default(),
        );
        let dispatcher = ChannelDispatcher::new(DispatchConfig::from(config));

        let (samples, ingress) = mpsc::channel(INGRESS_CAPACITY);
        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let scheduler = FrameScheduler::new(
            config,
            clock,
            writer,
            snapshots,
            dispatcher,
            ingress,
            command_rx,
        );

        Ok((
            Self {
                scheduler,
                shutdown: shutdown_rx,
            },
            PipelineHandle {
                samples,
                commands,
                shutdown: shutdown_tx,
            },
        ))
    }

    /// Registers a subscriber before the loop starts.
    pub fn subscribe(&mut self, id: impl Into<String>, channels: &[Channel]) -> Subscription {
        self.scheduler.dispatcher_mut().subscribe(id, channels)
    }

    /// Completes a subscriber's handshake.
    ///
    /// # Errors
    ///
    /// Propagates dispatcher errors for unknown subscribers or invalid
    /// transitions.
    pub fn complete_handshake(&mut self, id: &str) -> Result<(), DispatchError> {
        self.scheduler.dispatcher_mut().complete_handshake(id)
    }

    /// Runs the frame loop until shutdown.
    ///
    /// # Errors
    ///
    /// Returns the first ledger failure; everything recoverable is handled
    /// inside the loop.
    pub async fn run(mut self) -> Result<(), SchedulerError> {
        let shutdown = self.shutdown.clone();
        self.scheduler.run(shutdown).await
    }
}
