// src/supervisor/core.rs

//! Pure supervisor state machine.
//!
//! [`SupervisorCore`] consumes [`SupervisorEvent`]s and produces a
//! [`SupervisorStep`]: the commands the IO shell
//! ([`super::runtime::WorkerSupervisor`]) should execute, and whether the
//! loop keeps running. It owns no executor, queue or timer and performs no
//! IO, so every transition is unit tested without Tokio.

use std::time::Duration;

use crate::shutdown::{ShutdownAction, ShutdownState, ShutdownStatus};
use crate::types::ExitReport;

/// Where the control loop stands with respect to its executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    NoExecutor,
    ExecutorStarting,
    ExecutorRunning,
    /// An executor is alive after a shutdown request.
    Draining,
    Stopped,
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Nothing to do and the poll interval is zero.
    QueueEmpty,
    Shutdown,
    ForkFailuresExhausted(u32),
}

/// Inputs to the core, produced by the shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// Start of a poll cycle (run start, or retry after a failed launch).
    Poll,
    WorkAvailable,
    /// The readiness check timed out.
    NoWork,
    ForkSucceeded,
    ForkFailed { error: String },
    ExecutorExited(ExitReport),
    ShutdownRequested(ShutdownStatus),
    /// The escalation timer fired.
    EscalationDue,
}

/// Commands for the shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorCommand {
    RecoverOrphans,
    /// Check queue readiness, waiting up to the poll interval.
    AwaitWork,
    /// Run `before_fork` and launch an executor.
    Fork,
    NotifyExecutor(ShutdownState),
    DrainExecutor { grace: Duration },
    ScheduleEscalation { after: Duration },
    TerminateExecutor,
    KillExecutor,
    RetryAfter(Duration),
    Stop(StopReason),
}

/// Decision returned by the core after handling a single event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorStep {
    pub commands: Vec<SupervisorCommand>,
    pub keep_running: bool,
}

impl SupervisorStep {
    fn run(commands: Vec<SupervisorCommand>) -> Self {
        Self {
            commands,
            keep_running: true,
        }
    }

    fn stop(reason: StopReason) -> Self {
        Self {
            commands: vec![SupervisorCommand::Stop(reason)],
            keep_running: false,
        }
    }

    fn idle() -> Self {
        Self::run(Vec::new())
    }
}

/// Forced-shutdown progress for the live executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escalation {
    None,
    /// Waiting for a voluntary exit before sending the termination signal.
    AwaitingTerm { timeout: Duration },
    /// Termination signal sent; waiting before the hard kill.
    AwaitingKill,
}

/// Static parameters of the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreOptions {
    pub poll_interval: Duration,
    pub fork_retry_delay: Duration,
    pub max_fork_failures: u32,
}

#[derive(Debug)]
pub struct SupervisorCore {
    options: CoreOptions,
    state: SupervisorState,
    shutdown: ShutdownState,
    escalation: Escalation,
    consecutive_failures: u32,
    /// Shutdown that arrived while an executor was being launched.
    deferred: Option<ShutdownStatus>,
}

impl SupervisorCore {
    pub fn new(options: CoreOptions, shutdown: ShutdownState) -> Self {
        Self {
            options,
            state: SupervisorState::NoExecutor,
            shutdown,
            escalation: Escalation::None,
            consecutive_failures: 0,
            deferred: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn shutdown_state(&self) -> ShutdownState {
        self.shutdown
    }

    /// Handle one event, returning the commands for the shell.
    pub fn step(&mut self, event: SupervisorEvent) -> SupervisorStep {
        if self.state == SupervisorState::Stopped {
            return SupervisorStep {
                commands: Vec::new(),
                keep_running: false,
            };
        }

        match event {
            SupervisorEvent::Poll => self.on_poll(),
            SupervisorEvent::WorkAvailable => self.on_work_available(),
            SupervisorEvent::NoWork => self.on_no_work(),
            SupervisorEvent::ForkSucceeded => {
                self.consecutive_failures = 0;
                self.state = SupervisorState::ExecutorRunning;
                match self.deferred.take() {
                    Some(status) => self.on_shutdown(status),
                    None => SupervisorStep::idle(),
                }
            }
            SupervisorEvent::ForkFailed { .. } => self.on_fork_failed(),
            SupervisorEvent::ExecutorExited(_) => self.on_executor_exited(),
            SupervisorEvent::ShutdownRequested(status) => self.on_shutdown(status),
            SupervisorEvent::EscalationDue => self.on_escalation_due(),
        }
    }

    fn stop(&mut self, reason: StopReason) -> SupervisorStep {
        self.state = SupervisorState::Stopped;
        SupervisorStep::stop(reason)
    }

    fn on_poll(&mut self) -> SupervisorStep {
        if self.state != SupervisorState::NoExecutor {
            return SupervisorStep::idle();
        }
        if self.shutdown.stops_claiming() {
            return self.stop(StopReason::Shutdown);
        }
        SupervisorStep::run(vec![
            SupervisorCommand::RecoverOrphans,
            SupervisorCommand::AwaitWork,
        ])
    }

    fn on_work_available(&mut self) -> SupervisorStep {
        if self.state != SupervisorState::NoExecutor {
            return SupervisorStep::idle();
        }
        if self.shutdown.stops_claiming() {
            return self.stop(StopReason::Shutdown);
        }
        self.state = SupervisorState::ExecutorStarting;
        SupervisorStep::run(vec![SupervisorCommand::Fork])
    }

    fn on_no_work(&mut self) -> SupervisorStep {
        if self.state != SupervisorState::NoExecutor {
            return SupervisorStep::idle();
        }
        if self.options.poll_interval.is_zero() {
            return self.stop(StopReason::QueueEmpty);
        }
        self.on_poll()
    }

    fn on_fork_failed(&mut self) -> SupervisorStep {
        self.state = SupervisorState::NoExecutor;
        if let Some(status) = self.deferred.take() {
            self.shutdown = self.shutdown.max(status.state);
        }
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.options.max_fork_failures {
            return self.stop(StopReason::ForkFailuresExhausted(self.consecutive_failures));
        }
        if self.shutdown.stops_claiming() {
            return self.stop(StopReason::Shutdown);
        }
        SupervisorStep::run(vec![SupervisorCommand::RetryAfter(
            self.options.fork_retry_delay,
        )])
    }

    fn on_executor_exited(&mut self) -> SupervisorStep {
        if !matches!(
            self.state,
            SupervisorState::ExecutorRunning | SupervisorState::Draining
        ) {
            return SupervisorStep::idle();
        }
        self.state = SupervisorState::NoExecutor;
        self.escalation = Escalation::None;

        // Hard stop: the abandoned claim stays as it is.
        if self.shutdown == ShutdownState::Terminated {
            return self.stop(StopReason::Shutdown);
        }

        let mut commands = vec![SupervisorCommand::RecoverOrphans];
        if self.shutdown.stops_claiming() {
            self.state = SupervisorState::Stopped;
            commands.push(SupervisorCommand::Stop(StopReason::Shutdown));
            return SupervisorStep {
                commands,
                keep_running: false,
            };
        }

        // Rotation or crash alike: the next job always gets a fresh fork.
        commands.push(SupervisorCommand::AwaitWork);
        SupervisorStep::run(commands)
    }

    fn on_shutdown(&mut self, status: ShutdownStatus) -> SupervisorStep {
        if status.state <= self.shutdown {
            return SupervisorStep::idle();
        }
        if self.state == SupervisorState::ExecutorStarting {
            if self.deferred.is_none_or(|d| status.state > d.state) {
                self.deferred = Some(status);
            }
            return SupervisorStep::idle();
        }
        self.shutdown = status.state;

        match self.state {
            SupervisorState::NoExecutor => {
                if self.shutdown.stops_claiming() {
                    self.stop(StopReason::Shutdown)
                } else {
                    SupervisorStep::idle()
                }
            }
            SupervisorState::ExecutorStarting => SupervisorStep::idle(),
            SupervisorState::ExecutorRunning | SupervisorState::Draining => {
                self.state = SupervisorState::Draining;
                self.apply_action(status)
            }
            SupervisorState::Stopped => SupervisorStep::idle(),
        }
    }

    fn apply_action(&mut self, status: ShutdownStatus) -> SupervisorStep {
        let notify = SupervisorCommand::NotifyExecutor(status.state);
        match status.action {
            None | Some(ShutdownAction::Cooperative) => SupervisorStep::run(vec![notify]),
            Some(ShutdownAction::Drain { grace }) => {
                SupervisorStep::run(vec![notify, SupervisorCommand::DrainExecutor { grace }])
            }
            Some(ShutdownAction::Escalate { after }) => {
                // A second forced trigger does not restart the clock.
                if self.escalation != Escalation::None {
                    return SupervisorStep::run(vec![notify]);
                }
                self.escalation = Escalation::AwaitingTerm { timeout: after };
                SupervisorStep::run(vec![
                    notify,
                    SupervisorCommand::ScheduleEscalation { after },
                ])
            }
            Some(ShutdownAction::Kill) => {
                self.escalation = Escalation::None;
                SupervisorStep::run(vec![SupervisorCommand::KillExecutor])
            }
        }
    }

    fn on_escalation_due(&mut self) -> SupervisorStep {
        if !matches!(
            self.state,
            SupervisorState::ExecutorRunning | SupervisorState::Draining
        ) {
            return SupervisorStep::idle();
        }
        match self.escalation {
            Escalation::None => SupervisorStep::idle(),
            Escalation::AwaitingTerm { timeout } => {
                self.escalation = Escalation::AwaitingKill;
                SupervisorStep::run(vec![
                    SupervisorCommand::TerminateExecutor,
                    SupervisorCommand::ScheduleEscalation { after: timeout },
                ])
            }
            Escalation::AwaitingKill => {
                self.escalation = Escalation::None;
                SupervisorStep::run(vec![SupervisorCommand::KillExecutor])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecutorId, ExitReason};

    use SupervisorCommand as Cmd;
    use SupervisorEvent as Ev;

    fn core(poll: Duration) -> SupervisorCore {
        SupervisorCore::new(
            CoreOptions {
                poll_interval: poll,
                fork_retry_delay: Duration::from_secs(1),
                max_fork_failures: 3,
            },
            ShutdownState::Running,
        )
    }

    fn exited(reason: ExitReason) -> Ev {
        Ev::ExecutorExited(ExitReport {
            executor: ExecutorId::new(1, 1),
            processed: 1,
            reason,
        })
    }

    fn shutdown(state: ShutdownState, action: ShutdownAction) -> Ev {
        Ev::ShutdownRequested(ShutdownStatus {
            state,
            action: Some(action),
        })
    }

    fn running(poll: Duration) -> SupervisorCore {
        let mut c = core(poll);
        c.step(Ev::Poll);
        c.step(Ev::WorkAvailable);
        c.step(Ev::ForkSucceeded);
        assert_eq!(c.state(), SupervisorState::ExecutorRunning);
        c
    }

    #[test]
    fn poll_recovers_then_waits_for_work() {
        let mut c = core(Duration::ZERO);
        let step = c.step(Ev::Poll);
        assert_eq!(step.commands, vec![Cmd::RecoverOrphans, Cmd::AwaitWork]);
        assert!(step.keep_running);

        let step = c.step(Ev::WorkAvailable);
        assert_eq!(step.commands, vec![Cmd::Fork]);
        assert_eq!(c.state(), SupervisorState::ExecutorStarting);
    }

    #[test]
    fn empty_queue_with_zero_interval_stops() {
        let mut c = core(Duration::ZERO);
        c.step(Ev::Poll);
        let step = c.step(Ev::NoWork);
        assert_eq!(step.commands, vec![Cmd::Stop(StopReason::QueueEmpty)]);
        assert!(!step.keep_running);
        assert_eq!(c.state(), SupervisorState::Stopped);
    }

    #[test]
    fn empty_queue_with_interval_keeps_polling() {
        let mut c = core(Duration::from_secs(5));
        c.step(Ev::Poll);
        let step = c.step(Ev::NoWork);
        assert_eq!(step.commands, vec![Cmd::RecoverOrphans, Cmd::AwaitWork]);
        assert!(step.keep_running);
    }

    #[test]
    fn rotation_exit_recovers_and_polls_again() {
        let mut c = running(Duration::ZERO);
        let step = c.step(exited(ExitReason::JobLimit));
        assert_eq!(step.commands, vec![Cmd::RecoverOrphans, Cmd::AwaitWork]);
        assert_eq!(c.state(), SupervisorState::NoExecutor);
    }

    #[test]
    fn graceful_shutdown_notifies_then_stops_after_exit() {
        let mut c = running(Duration::ZERO);
        let step = c.step(shutdown(
            ShutdownState::GracefulRequested,
            ShutdownAction::Cooperative,
        ));
        assert_eq!(
            step.commands,
            vec![Cmd::NotifyExecutor(ShutdownState::GracefulRequested)]
        );
        assert_eq!(c.state(), SupervisorState::Draining);

        let step = c.step(exited(ExitReason::Shutdown));
        assert_eq!(
            step.commands,
            vec![Cmd::RecoverOrphans, Cmd::Stop(StopReason::Shutdown)]
        );
        assert!(!step.keep_running);
    }

    #[test]
    fn hard_stop_kills_without_recovery() {
        let mut c = running(Duration::ZERO);
        let step = c.step(shutdown(ShutdownState::Terminated, ShutdownAction::Kill));
        assert_eq!(step.commands, vec![Cmd::KillExecutor]);

        let step = c.step(exited(ExitReason::Killed));
        assert_eq!(step.commands, vec![Cmd::Stop(StopReason::Shutdown)]);
    }

    #[test]
    fn escalation_terminates_then_kills() {
        let t = Duration::from_millis(500);
        let mut c = running(Duration::ZERO);

        let step = c.step(shutdown(
            ShutdownState::ForceRequested,
            ShutdownAction::Escalate { after: t },
        ));
        assert_eq!(
            step.commands,
            vec![
                Cmd::NotifyExecutor(ShutdownState::ForceRequested),
                Cmd::ScheduleEscalation { after: t }
            ]
        );

        let step = c.step(Ev::EscalationDue);
        assert_eq!(
            step.commands,
            vec![Cmd::TerminateExecutor, Cmd::ScheduleEscalation { after: t }]
        );

        let step = c.step(Ev::EscalationDue);
        assert_eq!(step.commands, vec![Cmd::KillExecutor]);

        // Killed during escalation: recovery still runs.
        let step = c.step(exited(ExitReason::Killed));
        assert_eq!(
            step.commands,
            vec![Cmd::RecoverOrphans, Cmd::Stop(StopReason::Shutdown)]
        );
    }

    #[test]
    fn drain_forwards_grace() {
        let t = Duration::from_secs(2);
        let mut c = running(Duration::ZERO);
        let step = c.step(shutdown(
            ShutdownState::GracefulRequested,
            ShutdownAction::Drain { grace: t },
        ));
        assert_eq!(
            step.commands,
            vec![
                Cmd::NotifyExecutor(ShutdownState::GracefulRequested),
                Cmd::DrainExecutor { grace: t }
            ]
        );
    }

    #[test]
    fn stale_shutdown_status_is_ignored() {
        let mut c = running(Duration::ZERO);
        c.step(shutdown(
            ShutdownState::ForceRequested,
            ShutdownAction::Escalate {
                after: Duration::from_secs(1),
            },
        ));
        let step = c.step(shutdown(
            ShutdownState::GracefulRequested,
            ShutdownAction::Cooperative,
        ));
        assert!(step.commands.is_empty());
        assert_eq!(c.shutdown_state(), ShutdownState::ForceRequested);
    }

    #[test]
    fn shutdown_while_idle_stops() {
        let mut c = core(Duration::from_secs(5));
        c.step(Ev::Poll);
        let step = c.step(shutdown(
            ShutdownState::GracefulRequested,
            ShutdownAction::Cooperative,
        ));
        assert_eq!(step.commands, vec![Cmd::Stop(StopReason::Shutdown)]);
    }

    #[test]
    fn fork_failures_retry_then_give_up() {
        let mut c = core(Duration::ZERO);
        for _ in 0..2 {
            c.step(Ev::Poll);
            c.step(Ev::WorkAvailable);
            let step = c.step(Ev::ForkFailed {
                error: "spawn".into(),
            });
            assert_eq!(
                step.commands,
                vec![Cmd::RetryAfter(Duration::from_secs(1))]
            );
        }
        c.step(Ev::Poll);
        c.step(Ev::WorkAvailable);
        let step = c.step(Ev::ForkFailed {
            error: "spawn".into(),
        });
        assert_eq!(
            step.commands,
            vec![Cmd::Stop(StopReason::ForkFailuresExhausted(3))]
        );
    }

    #[test]
    fn successful_fork_resets_failure_count() {
        let mut c = core(Duration::ZERO);
        c.step(Ev::Poll);
        c.step(Ev::WorkAvailable);
        c.step(Ev::ForkFailed {
            error: "spawn".into(),
        });
        c.step(Ev::Poll);
        c.step(Ev::WorkAvailable);
        c.step(Ev::ForkSucceeded);
        c.step(exited(ExitReason::QueueDrained));
        for _ in 0..2 {
            c.step(Ev::WorkAvailable);
            let step = c.step(Ev::ForkFailed {
                error: "spawn".into(),
            });
            assert!(step.keep_running);
            c.step(Ev::Poll);
        }
    }

    #[test]
    fn shutdown_during_launch_applies_once_running() {
        let mut c = core(Duration::ZERO);
        c.step(Ev::Poll);
        c.step(Ev::WorkAvailable);
        let step = c.step(shutdown(ShutdownState::Terminated, ShutdownAction::Kill));
        assert!(step.commands.is_empty());

        let step = c.step(Ev::ForkSucceeded);
        assert_eq!(step.commands, vec![Cmd::KillExecutor]);
        assert_eq!(c.shutdown_state(), ShutdownState::Terminated);
    }

    #[test]
    fn shutdown_before_run_stops_at_first_poll() {
        let mut c = SupervisorCore::new(
            CoreOptions {
                poll_interval: Duration::ZERO,
                fork_retry_delay: Duration::ZERO,
                max_fork_failures: 1,
            },
            ShutdownState::GracefulRequested,
        );
        let step = c.step(Ev::Poll);
        assert_eq!(step.commands, vec![Cmd::Stop(StopReason::Shutdown)]);
    }
}
