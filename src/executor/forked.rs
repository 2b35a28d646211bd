// src/executor/forked.rs

//! The executor side of a fork cycle.
//!
//! A [`ForkedExecutor`] runs inside one executor unit. It claims jobs one at
//! a time, runs them through a [`Perform`] implementation, and decides when
//! the unit has to go: fork budget used up, queue drained, or a shutdown,
//! drain or termination request from the supervisor.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::JobError;
use crate::hooks::Hooks;
use crate::perform::Perform;
use crate::policy::{ForkBudget, ForkPolicy};
use crate::queue::{JobClaim, JobQueue};
use crate::shutdown::{ShutdownState, ShutdownWatch};
use crate::types::{ExecutorId, ExitReason, ExitReport};

use super::protocol::{ExecutorEvent, JobOutcome};

/// Inputs from the supervisor, as seen from inside the unit.
#[derive(Debug)]
pub struct ExecutorControl {
    shutdown: ShutdownWatch,
    drain: watch::Receiver<Option<Duration>>,
    term: CancellationToken,
}

impl ExecutorControl {
    /// `drain` holds the grace period once a drain was requested; `term`
    /// is cancelled by the termination signal.
    pub fn new(
        shutdown: ShutdownWatch,
        drain: watch::Receiver<Option<Duration>>,
        term: CancellationToken,
    ) -> Self {
        Self {
            shutdown,
            drain,
            term,
        }
    }

    fn stops_claiming(&self) -> bool {
        self.shutdown.state().stops_claiming() || self.drain.borrow().is_some()
    }

    /// Resolve once claiming has to stop.
    async fn stop_requested(&mut self) {
        let shutdown = &mut self.shutdown;
        let drain = &mut self.drain;
        tokio::select! {
            _ = shutdown.reached(ShutdownState::GracefulRequested) => {}
            _ = drain_requested(drain) => {}
        }
    }
}

async fn drain_requested(drain: &mut watch::Receiver<Option<Duration>>) -> Duration {
    // Copy the grace out so the watch guard is released before any await.
    let grace = drain.wait_for(Option::is_some).await.map(|grace| *grace);
    match grace {
        Ok(grace) => grace.unwrap_or_default(),
        Err(_) => std::future::pending().await,
    }
}

enum JobRun {
    Finished(Result<(), String>),
    Terminated,
    Abandoned,
}

/// Runs jobs sequentially until the fork has to end.
pub struct ForkedExecutor {
    id: ExecutorId,
    policy: ForkPolicy,
    poll_interval: Duration,
    queue: Arc<dyn JobQueue>,
    performer: Arc<dyn Perform>,
    hooks: Arc<dyn Hooks>,
}

impl ForkedExecutor {
    pub fn new(
        id: ExecutorId,
        policy: ForkPolicy,
        poll_interval: Duration,
        queue: Arc<dyn JobQueue>,
        performer: Arc<dyn Perform>,
        hooks: Arc<dyn Hooks>,
    ) -> Self {
        Self {
            id,
            policy,
            poll_interval,
            queue,
            performer,
            hooks,
        }
    }

    /// Run the whole fork cycle: `after_fork`, jobs, `before_child_exit`.
    ///
    /// Events are best effort; a closed channel does not stop the cycle.
    pub async fn run(
        self,
        mut control: ExecutorControl,
        events: mpsc::UnboundedSender<ExecutorEvent>,
    ) -> ExitReport {
        self.hooks.after_fork().await;
        let _ = events.send(ExecutorEvent::Ready);
        info!(executor = %self.id, "executor started");

        let mut processed = 0u64;
        let reason = self.work(&mut control, &events, &mut processed).await;

        info!(executor = %self.id, processed, reason = reason.as_label(), "executor exiting");
        self.hooks.before_child_exit(processed).await;
        let _ = events.send(ExecutorEvent::Exiting {
            processed,
            reason: reason.clone(),
        });

        ExitReport {
            executor: self.id,
            processed,
            reason,
        }
    }

    async fn work(
        &self,
        control: &mut ExecutorControl,
        events: &mpsc::UnboundedSender<ExecutorEvent>,
        processed: &mut u64,
    ) -> ExitReason {
        let term = control.term.clone();
        if !self.policy.start_lag.is_zero() {
            tokio::select! {
                _ = term.cancelled() => return ExitReason::Terminated,
                _ = tokio::time::sleep(self.policy.start_lag) => {}
            }
        }

        let mut budget = ForkBudget::new(self.policy);

        loop {
            if term.is_cancelled() {
                return ExitReason::Terminated;
            }
            if control.stops_claiming() {
                return ExitReason::Shutdown;
            }

            let ready = tokio::select! {
                biased;
                _ = term.cancelled() => return ExitReason::Terminated,
                _ = control.stop_requested() => return ExitReason::Shutdown,
                ready = self.queue.wait_ready(self.poll_interval) => ready,
            };

            // The claim itself is never raced against a stop request.
            let claimed = match ready {
                Ok(true) => self.queue.claim_next(self.id, Duration::ZERO).await,
                Ok(false) => Ok(None),
                Err(err) => Err(err),
            };
            let claim = match claimed {
                Ok(claim) => claim,
                Err(err) => {
                    warn!(executor = %self.id, error = %err, "claiming a job failed");
                    None
                }
            };
            let Some(claim) = claim else {
                if self.poll_interval.is_zero() {
                    return ExitReason::QueueDrained;
                }
                if let Some(reason) = budget.exhausted(*processed, Instant::now()) {
                    return reason;
                }
                continue;
            };

            if term.is_cancelled() || control.stops_claiming() {
                self.hand_back(&claim).await;
                if term.is_cancelled() {
                    return ExitReason::Terminated;
                }
                return ExitReason::Shutdown;
            }

            let job = claim.job.id.clone();
            let _ = events.send(ExecutorEvent::JobStarted { job: job.clone() });

            match self.run_job(&claim, control).await {
                JobRun::Finished(result) => {
                    *processed += 1;
                    let outcome = self.resolve(&claim, result).await;
                    let _ = events.send(ExecutorEvent::JobFinished {
                        job,
                        outcome,
                        processed: *processed,
                    });

                    let now = Instant::now();
                    budget.job_finished(now);
                    if let Some(reason) = budget.exhausted(*processed, now) {
                        return reason;
                    }
                }
                JobRun::Terminated => {
                    *processed += 1;
                    let outcome = self.resolve_failed(&claim, JobError::Termination).await;
                    let _ = events.send(ExecutorEvent::JobFinished {
                        job,
                        outcome,
                        processed: *processed,
                    });
                    return ExitReason::Terminated;
                }
                JobRun::Abandoned => {
                    let _ = events.send(ExecutorEvent::JobFinished {
                        job,
                        outcome: JobOutcome::Abandoned,
                        processed: *processed,
                    });
                    return ExitReason::Shutdown;
                }
            }
        }
    }

    /// Run one job until it finishes, the unit is terminated, or a drain
    /// deadline passes.
    async fn run_job(&self, claim: &JobClaim, control: &mut ExecutorControl) -> JobRun {
        debug!(executor = %self.id, job = %claim.job.id, "performing job");

        let perform = self.performer.perform(&claim.job);
        tokio::pin!(perform);

        let mut deadline: Option<Instant> = None;
        loop {
            let expired = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = control.term.cancelled() => return JobRun::Terminated,
                result = &mut perform => return JobRun::Finished(result),
                _ = expired => return JobRun::Abandoned,
                grace = drain_requested(&mut control.drain), if deadline.is_none() => {
                    debug!(executor = %self.id, job = %claim.job.id, ?grace, "drain requested during job");
                    deadline = Some(Instant::now() + grace);
                }
            }
        }
    }

    async fn resolve(&self, claim: &JobClaim, result: Result<(), String>) -> JobOutcome {
        match result {
            Ok(()) => {
                if let Err(err) = self.queue.complete(claim).await {
                    warn!(executor = %self.id, job = %claim.job.id, error = %err, "recording completion failed");
                }
                JobOutcome::Completed
            }
            Err(message) => self.resolve_failed(claim, JobError::execution(message)).await,
        }
    }

    /// Return a claim that landed after a stop request.
    async fn hand_back(&self, claim: &JobClaim) {
        match self.queue.release(claim).await {
            Ok(_) => debug!(executor = %self.id, job = %claim.job.id, "handed back late claim"),
            Err(err) => {
                warn!(executor = %self.id, job = %claim.job.id, error = %err, "handing back claim failed");
            }
        }
    }

    async fn resolve_failed(&self, claim: &JobClaim, error: JobError) -> JobOutcome {
        if let Err(err) = self.queue.fail(claim, error.clone()).await {
            warn!(executor = %self.id, job = %claim.job.id, error = %err, "recording failure failed");
        }
        JobOutcome::Failed { error }
    }
}
