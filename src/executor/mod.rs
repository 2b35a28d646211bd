// src/executor/mod.rs

//! Executor units: the short-lived workers that run jobs for one fork
//! cycle.
//!
//! - [`forked`]: the job loop that runs inside a unit.
//! - [`backend`]: how the supervisor launches and controls units.
//! - [`task`] / [`process`]: the two bundled backends.
//! - [`protocol`] / [`child`]: the control protocol and the executor
//!   process entry point.

pub mod backend;
pub mod child;
pub mod forked;
pub mod process;
pub mod protocol;
pub mod task;

use tokio::time::Instant;

use crate::types::{ExecutorId, ExitReason, ExitReport};

pub use backend::{ExecutorBackend, ExecutorUnit, LaunchRequest};
pub use forked::{ExecutorControl, ForkedExecutor};
pub use process::ProcessBackend;
pub use task::TaskBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorStatus {
    /// Launched, `after_fork` not yet confirmed.
    Starting,
    Running,
    Exited,
}

/// The supervisor's handle on its single live executor unit.
pub struct ExecutorHandle {
    unit: Box<dyn ExecutorUnit>,
    started_at: Instant,
    exit: Option<ExitReason>,
}

impl ExecutorHandle {
    pub fn new(unit: Box<dyn ExecutorUnit>) -> Self {
        Self {
            unit,
            started_at: Instant::now(),
            exit: None,
        }
    }

    pub fn id(&self) -> ExecutorId {
        self.unit.id()
    }

    pub fn pid(&self) -> Option<u32> {
        self.unit.pid()
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn jobs_processed(&self) -> u64 {
        self.unit.processed()
    }

    pub fn status(&self) -> ExecutorStatus {
        if self.exit.is_some() {
            ExecutorStatus::Exited
        } else if self.unit.is_ready() {
            ExecutorStatus::Running
        } else {
            ExecutorStatus::Starting
        }
    }

    /// Wait for the unit to exit. Cancel-safe.
    pub async fn wait(&mut self) -> ExitReport {
        let report = self.unit.wait().await;
        self.exit = Some(report.reason.clone());
        report
    }

    pub fn unit_mut(&mut self) -> &mut dyn ExecutorUnit {
        self.unit.as_mut()
    }
}

impl std::fmt::Debug for ExecutorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorHandle")
            .field("id", &self.id())
            .field("pid", &self.pid())
            .field("status", &self.status())
            .field("jobs_processed", &self.jobs_processed())
            .finish_non_exhaustive()
    }
}
