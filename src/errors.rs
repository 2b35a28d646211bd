// src/errors.rs

//! Crate-wide error types.
//!
//! - [`MultiforkError`] covers supervisor-level faults (config, IO, launch
//!   failures, protocol violations).
//! - [`JobError`] is the taxonomy recorded against a single job through the
//!   queue's failure channel. It never escapes the job boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ExecutorId;

#[derive(Error, Debug)]
pub enum MultiforkError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Failed to launch executor: {0}")]
    Launch(String),

    #[error("Giving up after {0} consecutive executor launch failures")]
    ForkFailuresExhausted(u32),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, MultiforkError>;

/// Failure recorded against a job.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobError {
    /// Raised by the job's own code.
    #[error("job failed: {message}")]
    Execution { message: String },

    /// Injected when a forced termination interrupts the job in flight.
    #[error("job interrupted by executor termination")]
    Termination,

    /// Recorded by orphan recovery: the claiming executor died without
    /// resolving the job. Attributed to the supervisor, not the dead unit.
    #[error("executor {executor} terminated before finishing the job")]
    WorkerTerminated { executor: ExecutorId },
}

impl JobError {
    pub fn execution(message: impl Into<String>) -> Self {
        JobError::Execution {
            message: message.into(),
        }
    }

    /// Short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            JobError::Execution { .. } => "job_execution",
            JobError::Termination => "job_termination",
            JobError::WorkerTerminated { .. } => "worker_terminated",
        }
    }
}
