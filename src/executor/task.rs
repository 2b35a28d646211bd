// src/executor/task.rs

//! Executor units as tokio tasks.
//!
//! There is no process isolation: a job that corrupts shared state affects
//! the supervisor too. Termination cancels the unit's token, a drain is a
//! `watch` update, and a hard kill aborts the task, which drops the job
//! future without running any hook.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::errors::Result;
use crate::hooks::Hooks;
use crate::perform::Perform;
use crate::policy::ShutdownPolicy;
use crate::queue::JobQueue;
use crate::shutdown::{ShutdownController, ShutdownState};
use crate::types::{ExecutorId, ExitReason, ExitReport};

use super::backend::{ExecutorBackend, ExecutorUnit, LaunchRequest, UnitFuture, UnitProgress};
use super::forked::{ExecutorControl, ForkedExecutor};
use super::protocol::ExecutorEvent;

/// Launches each fork cycle as a [`ForkedExecutor`] on its own task.
#[derive(Clone)]
pub struct TaskBackend {
    queue: Arc<dyn JobQueue>,
    performer: Arc<dyn Perform>,
    hooks: Arc<dyn Hooks>,
}

impl TaskBackend {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        performer: Arc<dyn Perform>,
        hooks: Arc<dyn Hooks>,
    ) -> Self {
        Self {
            queue,
            performer,
            hooks,
        }
    }
}

impl ExecutorBackend for TaskBackend {
    fn launch(
        &mut self,
        request: LaunchRequest,
    ) -> UnitFuture<'_, Result<Box<dyn ExecutorUnit>>> {
        let executor = ForkedExecutor::new(
            request.executor,
            request.fork,
            request.poll_interval,
            self.queue.clone(),
            self.performer.clone(),
            self.hooks.clone(),
        );

        Box::pin(async move {
            // The unit's own copy of the shutdown state; only the supervisor
            // moves it forward, through `notify`.
            let shutdown = ShutdownController::new(ShutdownPolicy::default());
            shutdown.advance_to(request.shutdown);
            let (drain, drain_rx) = watch::channel(None);
            let term = CancellationToken::new();
            let (events_tx, events) = mpsc::unbounded_channel();

            let control = ExecutorControl::new(shutdown.subscribe(), drain_rx, term.clone());
            let handle = tokio::spawn(executor.run(control, events_tx));

            let unit: Box<dyn ExecutorUnit> = Box::new(TaskUnit {
                progress: UnitProgress::new(request.executor),
                shutdown,
                drain,
                term,
                events,
                handle,
                exit: None,
            });
            Ok(unit)
        })
    }
}

struct TaskUnit {
    progress: UnitProgress,
    shutdown: ShutdownController,
    drain: watch::Sender<Option<Duration>>,
    term: CancellationToken,
    events: mpsc::UnboundedReceiver<ExecutorEvent>,
    handle: JoinHandle<ExitReport>,
    exit: Option<ExitReport>,
}

impl ExecutorUnit for TaskUnit {
    fn id(&self) -> ExecutorId {
        self.progress.id
    }

    fn pid(&self) -> Option<u32> {
        None
    }

    fn is_ready(&self) -> bool {
        self.progress.ready
    }

    fn processed(&self) -> u64 {
        self.progress.processed
    }

    fn wait(&mut self) -> UnitFuture<'_, ExitReport> {
        Box::pin(async move {
            if let Some(report) = &self.exit {
                return report.clone();
            }

            loop {
                tokio::select! {
                    Some(event) = self.events.recv() => self.progress.observe(event),
                    joined = &mut self.handle => {
                        while let Ok(event) = self.events.try_recv() {
                            self.progress.observe(event);
                        }
                        let report = match joined {
                            Ok(report) => report,
                            Err(err) if err.is_cancelled() => self.progress.finish(ExitReason::Killed),
                            Err(err) => {
                                error!(executor = %self.progress.id, error = %err, "executor task panicked");
                                self.progress.finish(ExitReason::Crashed(err.to_string()))
                            }
                        };
                        self.exit = Some(report.clone());
                        return report;
                    }
                }
            }
        })
    }

    fn notify(&mut self, state: ShutdownState) -> UnitFuture<'_, Result<()>> {
        self.shutdown.advance_to(state);
        Box::pin(async { Ok(()) })
    }

    fn drain(&mut self, grace: Duration) -> UnitFuture<'_, Result<()>> {
        self.drain.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(grace);
                true
            } else {
                false
            }
        });
        Box::pin(async { Ok(()) })
    }

    fn terminate(&mut self) -> Result<()> {
        self.term.cancel();
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        self.handle.abort();
        Ok(())
    }
}
