// src/executor/backend.rs

//! Pluggable executor backend abstraction.
//!
//! The supervisor launches executor units through an [`ExecutorBackend`]
//! and drives each one through the [`ExecutorUnit`] it gets back. This keeps
//! the control loop identical whether a unit is a separate OS process
//! ([`super::process::ProcessBackend`]) or an isolated tokio task
//! ([`super::task::TaskBackend`], used by embedders and tests).

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, warn};

use crate::errors::Result;
use crate::policy::ForkPolicy;
use crate::shutdown::ShutdownState;
use crate::types::{ExecutorId, ExitReason, ExitReport};

use super::protocol::{ExecutorEvent, JobOutcome};

pub type UnitFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Everything a backend needs to start one fork cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchRequest {
    pub executor: ExecutorId,
    pub fork: ForkPolicy,
    /// Shutdown state at launch time.
    pub shutdown: ShutdownState,
    pub poll_interval: Duration,
}

/// Trait abstracting how executor units are started.
pub trait ExecutorBackend: Send {
    /// Start a unit. `Err` is a launch failure: the cycle is abandoned and
    /// the supervisor retries later.
    fn launch(
        &mut self,
        request: LaunchRequest,
    ) -> UnitFuture<'_, Result<Box<dyn ExecutorUnit>>>;
}

/// Supervisor-side control surface of one live executor unit.
pub trait ExecutorUnit: Send {
    fn id(&self) -> ExecutorId;

    /// OS process id, for process-backed units.
    fn pid(&self) -> Option<u32>;

    /// Whether the unit has reported `ready` (i.e. `after_fork` has run).
    fn is_ready(&self) -> bool;

    /// Jobs the unit has reported as counted so far.
    fn processed(&self) -> u64;

    /// Resolve when the unit has exited. Cancel-safe; once resolved, later
    /// calls return the same report immediately.
    fn wait(&mut self) -> UnitFuture<'_, ExitReport>;

    /// Forward a shutdown state change.
    fn notify(&mut self, state: ShutdownState) -> UnitFuture<'_, Result<()>>;

    /// Ask the unit to stop claiming and abandon its job after `grace`.
    fn drain(&mut self, grace: Duration) -> UnitFuture<'_, Result<()>>;

    /// Deliver the termination signal: the job in flight fails with
    /// `Termination` and the unit exits after its exit hook.
    fn terminate(&mut self) -> Result<()>;

    /// Stop the unit immediately. No hook runs; `wait` then reports
    /// [`ExitReason::Killed`].
    fn kill(&mut self) -> Result<()>;
}

/// Bookkeeping shared by the bundled units: folds the event stream into a
/// job count and the final report.
#[derive(Debug)]
pub(crate) struct UnitProgress {
    pub id: ExecutorId,
    pub ready: bool,
    pub processed: u64,
    pub reported: Option<ExitReport>,
}

impl UnitProgress {
    pub fn new(id: ExecutorId) -> Self {
        Self {
            id,
            ready: false,
            processed: 0,
            reported: None,
        }
    }

    pub fn observe(&mut self, event: ExecutorEvent) {
        match event {
            ExecutorEvent::Ready => {
                debug!(executor = %self.id, "executor ready");
                self.ready = true;
            }
            ExecutorEvent::JobStarted { job } => {
                debug!(executor = %self.id, %job, "job started");
            }
            ExecutorEvent::JobFinished {
                job,
                outcome,
                processed,
            } => {
                match &outcome {
                    JobOutcome::Completed => debug!(executor = %self.id, %job, "job completed"),
                    JobOutcome::Failed { error } => {
                        warn!(executor = %self.id, %job, error = error.as_label(), "job failed")
                    }
                    JobOutcome::Abandoned => {
                        warn!(executor = %self.id, %job, "job abandoned at drain deadline")
                    }
                }
                self.processed = processed;
            }
            ExecutorEvent::Exiting { processed, reason } => {
                self.processed = processed;
                self.reported = Some(ExitReport {
                    executor: self.id,
                    processed,
                    reason,
                });
            }
        }
    }

    /// Final report once the unit is gone; `fallback` applies when the
    /// unit never sent `exiting`.
    pub fn finish(&mut self, fallback: ExitReason) -> ExitReport {
        self.reported.take().unwrap_or(ExitReport {
            executor: self.id,
            processed: self.processed,
            reason: fallback,
        })
    }
}
