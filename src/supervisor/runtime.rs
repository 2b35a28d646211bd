// src/supervisor/runtime.rs

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::WorkerSettings;
use crate::errors::{MultiforkError, Result};
use crate::executor::{ExecutorBackend, ExecutorHandle, LaunchRequest};
use crate::hooks::Hooks;
use crate::policy::ForkPolicy;
use crate::queue::JobQueue;
use crate::shutdown::{ShutdownController, ShutdownState, ShutdownWatch};
use crate::types::{ExecutorId, ExitReport};

use super::core::{
    CoreOptions, StopReason, SupervisorCommand, SupervisorCore, SupervisorEvent,
};
use super::orphan::OrphanRecovery;

/// Launch-failure handling for the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub fork_retry_delay: Duration,
    pub max_fork_failures: u32,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            fork_retry_delay: Duration::from_secs(1),
            max_fork_failures: 5,
        }
    }
}

impl From<&WorkerSettings> for SupervisorSettings {
    fn from(worker: &WorkerSettings) -> Self {
        Self {
            fork_retry_delay: worker.fork_retry_delay,
            max_fork_failures: worker.max_fork_failures,
        }
    }
}

/// What a finished run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub forks: u64,
    pub jobs_processed: u64,
    pub exits: Vec<ExitReport>,
    pub orphans_recovered: usize,
    pub stop: StopReason,
}

/// What the loop waits on while no executor is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wait {
    Idle,
    Work,
    Retry(Instant),
}

/// Bookkeeping for one `run` call.
struct RunState {
    poll_interval: Duration,
    pending: VecDeque<SupervisorEvent>,
    wait: Wait,
    escalation_at: Option<Instant>,
    forks: u64,
    exits: Vec<ExitReport>,
    orphans_recovered: usize,
    stop: Option<StopReason>,
}

/// Parent control loop: forks one executor unit at a time and reacts to
/// its exit, to shutdown requests and to queue readiness.
///
/// All decisions are made by [`SupervisorCore`]; this type performs the IO
/// the core asks for.
pub struct WorkerSupervisor<B: ExecutorBackend> {
    backend: B,
    queue: Arc<dyn JobQueue>,
    hooks: Arc<dyn Hooks>,
    shutdown: ShutdownController,
    fork: ForkPolicy,
    settings: SupervisorSettings,
    recovery: OrphanRecovery,
    pid: u32,
    seq: u64,
    executor: Option<ExecutorHandle>,
}

impl<B: ExecutorBackend> fmt::Debug for WorkerSupervisor<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSupervisor")
            .field("pid", &self.pid)
            .field("fork", &self.fork)
            .field("shutdown", &self.shutdown.state())
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl<B: ExecutorBackend> WorkerSupervisor<B> {
    pub fn new(
        backend: B,
        queue: Arc<dyn JobQueue>,
        hooks: Arc<dyn Hooks>,
        shutdown: ShutdownController,
        fork: ForkPolicy,
        settings: SupervisorSettings,
    ) -> Self {
        let pid = std::process::id();
        Self {
            backend,
            recovery: OrphanRecovery::new(queue.clone(), pid),
            queue,
            hooks,
            shutdown,
            fork,
            settings,
            pid,
            seq: 0,
            executor: None,
        }
    }

    /// Handle for requesting a shutdown from outside the loop.
    pub fn shutdown_handle(&self) -> ShutdownController {
        self.shutdown.clone()
    }

    /// Run until shutdown, or until the queue is empty when
    /// `poll_interval` is zero.
    ///
    /// Fails with [`MultiforkError::ForkFailuresExhausted`] after too many
    /// consecutive launch failures.
    pub async fn run(&mut self, poll_interval: Duration) -> Result<RunSummary> {
        let mut watch = self.shutdown.subscribe();
        let mut core = SupervisorCore::new(
            CoreOptions {
                poll_interval,
                fork_retry_delay: self.settings.fork_retry_delay,
                max_fork_failures: self.settings.max_fork_failures,
            },
            watch.state(),
        );
        let mut run = RunState {
            poll_interval,
            pending: VecDeque::from([SupervisorEvent::Poll]),
            wait: Wait::Idle,
            escalation_at: None,
            forks: 0,
            exits: Vec::new(),
            orphans_recovered: 0,
            stop: None,
        };

        info!(pid = self.pid, ?poll_interval, fork = ?self.fork, "supervisor started");

        loop {
            let event = match run.pending.pop_front() {
                Some(event) => event,
                None => self.next_event(&mut watch, &mut run).await?,
            };
            debug!(?event, state = ?core.state(), "supervisor event");

            let step = core.step(event);
            for command in step.commands {
                self.execute(command, &mut run).await?;
            }
            if !step.keep_running {
                break;
            }
        }

        let stop = run.stop.unwrap_or(StopReason::Shutdown);
        let summary = RunSummary {
            forks: run.forks,
            jobs_processed: run.exits.iter().map(|e| e.processed).sum(),
            exits: run.exits,
            orphans_recovered: run.orphans_recovered,
            stop,
        };
        info!(
            forks = summary.forks,
            processed = summary.jobs_processed,
            orphans = summary.orphans_recovered,
            ?stop,
            "supervisor stopped"
        );

        match stop {
            StopReason::ForkFailuresExhausted(n) => Err(MultiforkError::ForkFailuresExhausted(n)),
            _ => Ok(summary),
        }
    }

    /// Wait for whatever can happen next in the current state.
    async fn next_event(
        &mut self,
        watch: &mut ShutdownWatch,
        run: &mut RunState,
    ) -> Result<SupervisorEvent> {
        if let Some(handle) = self.executor.as_mut() {
            let escalation = sleep_until_opt(run.escalation_at);
            let event = tokio::select! {
                report = handle.wait() => SupervisorEvent::ExecutorExited(report),
                status = watch.changed() => SupervisorEvent::ShutdownRequested(status),
                () = escalation => SupervisorEvent::EscalationDue,
            };
            match &event {
                SupervisorEvent::ExecutorExited(report) => {
                    let uptime = handle.started_at().elapsed();
                    let what = if report.reason.is_rotation() {
                        "executor rotated"
                    } else {
                        "executor exited"
                    };
                    info!(
                        executor = %report.executor,
                        processed = report.processed,
                        reason = %report.reason,
                        ?uptime,
                        "{what}"
                    );
                    self.executor = None;
                    run.escalation_at = None;
                    run.exits.push(report.clone());
                }
                SupervisorEvent::EscalationDue => run.escalation_at = None,
                _ => {}
            }
            return Ok(event);
        }

        match run.wait {
            Wait::Work => {
                tokio::select! {
                    biased;
                    status = watch.changed() => Ok(SupervisorEvent::ShutdownRequested(status)),
                    ready = self.queue.wait_ready(run.poll_interval) => {
                        run.wait = Wait::Idle;
                        if ready? {
                            Ok(SupervisorEvent::WorkAvailable)
                        } else {
                            Ok(SupervisorEvent::NoWork)
                        }
                    }
                }
            }
            Wait::Retry(at) => {
                tokio::select! {
                    biased;
                    status = watch.changed() => Ok(SupervisorEvent::ShutdownRequested(status)),
                    () = tokio::time::sleep_until(at) => {
                        run.wait = Wait::Idle;
                        Ok(SupervisorEvent::Poll)
                    }
                }
            }
            Wait::Idle => Ok(SupervisorEvent::ShutdownRequested(watch.changed().await)),
        }
    }

    async fn execute(&mut self, command: SupervisorCommand, run: &mut RunState) -> Result<()> {
        match command {
            SupervisorCommand::RecoverOrphans => {
                let live = self.executor.as_ref().map(ExecutorHandle::id);
                match self.recovery.recover(live).await {
                    Ok(0) => {}
                    Ok(n) => {
                        info!(recovered = n, "failed orphaned jobs");
                        run.orphans_recovered += n;
                    }
                    Err(err) => warn!(error = %err, "orphan recovery failed"),
                }
            }
            SupervisorCommand::AwaitWork => run.wait = Wait::Work,
            SupervisorCommand::Fork => {
                let event = self.fork_executor(run.poll_interval).await;
                if matches!(event, SupervisorEvent::ForkSucceeded) {
                    run.forks += 1;
                }
                run.pending.push_back(event);
            }
            SupervisorCommand::NotifyExecutor(state) => {
                if let Some(handle) = self.executor.as_mut() {
                    debug!(executor = %handle.id(), ?state, "forwarding shutdown state");
                    if let Err(err) = handle.unit_mut().notify(state).await {
                        warn!(executor = %handle.id(), error = %err, "failed to notify executor");
                    }
                }
            }
            SupervisorCommand::DrainExecutor { grace } => {
                if let Some(handle) = self.executor.as_mut() {
                    info!(executor = %handle.id(), ?grace, "draining executor");
                    if let Err(err) = handle.unit_mut().drain(grace).await {
                        warn!(executor = %handle.id(), error = %err, "failed to drain executor");
                    }
                }
            }
            SupervisorCommand::ScheduleEscalation { after } => {
                run.escalation_at = Some(Instant::now() + after);
            }
            SupervisorCommand::TerminateExecutor => {
                if let Some(handle) = self.executor.as_mut() {
                    info!(executor = %handle.id(), "terminating executor");
                    if let Err(err) = handle.unit_mut().terminate() {
                        warn!(executor = %handle.id(), error = %err, "failed to terminate executor");
                    }
                }
            }
            SupervisorCommand::KillExecutor => {
                if let Some(handle) = self.executor.as_mut() {
                    warn!(executor = %handle.id(), "killing executor");
                    if let Err(err) = handle.unit_mut().kill() {
                        warn!(executor = %handle.id(), error = %err, "failed to kill executor");
                    }
                }
            }
            SupervisorCommand::RetryAfter(delay) => {
                run.wait = Wait::Retry(Instant::now() + delay);
            }
            SupervisorCommand::Stop(reason) => {
                if reason == StopReason::Shutdown {
                    self.shutdown.advance_to(ShutdownState::Terminated);
                }
                run.stop = Some(reason);
            }
        }
        Ok(())
    }

    async fn fork_executor(&mut self, poll_interval: Duration) -> SupervisorEvent {
        self.seq += 1;
        let executor = ExecutorId::new(self.pid, self.seq);

        self.hooks.before_fork().await;
        let request = LaunchRequest {
            executor,
            fork: self.fork,
            shutdown: self.shutdown.state(),
            poll_interval,
        };

        match self.backend.launch(request).await {
            Ok(unit) => {
                let handle = ExecutorHandle::new(unit);
                info!(executor = %executor, pid = ?handle.pid(), "forked executor");
                self.executor = Some(handle);
                SupervisorEvent::ForkSucceeded
            }
            Err(err) => {
                warn!(executor = %executor, error = %err, "failed to launch executor");
                SupervisorEvent::ForkFailed {
                    error: err.to_string(),
                }
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
