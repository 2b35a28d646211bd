// src/queue/mod.rs

//! Job queue abstraction and bundled implementations.
//!
//! The supervisor and executors only talk to [`JobQueue`]. A claim is the
//! record that a specific executor dequeued a job and has not resolved it
//! yet; `complete` and `fail` remove it with compare-and-remove semantics,
//! so exactly one caller wins when several race to resolve the same claim.
//!
//! - [`memory::MemoryQueue`]: in-process queue for task-backed executors
//!   and tests.
//! - [`spool::SpoolQueue`]: directory-backed queue shared between the
//!   supervisor and executor processes.

pub mod memory;
pub mod spool;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{JobError, Result};
use crate::types::{ExecutorId, JobId};

pub use memory::MemoryQueue;
pub use spool::SpoolQueue;

/// A unit of work. The payload is opaque to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub payload: String,
    pub enqueued_at_ms: u64,
}

impl Job {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            id: next_job_id(),
            payload: payload.into(),
            enqueued_at_ms: now_ms(),
        }
    }
}

/// A job assigned to an executor, pending completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobClaim {
    pub job: Job,
    pub executor: ExecutorId,
    pub claimed_at_ms: u64,
}

impl JobClaim {
    pub fn new(job: Job, executor: ExecutorId) -> Self {
        Self {
            job,
            executor,
            claimed_at_ms: now_ms(),
        }
    }
}

/// A job recorded as failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub job: Job,
    /// Executor that held the claim when it failed.
    pub executor: ExecutorId,
    pub error: JobError,
    pub failed_at_ms: u64,
}

impl FailureRecord {
    pub fn new(claim: &JobClaim, error: JobError) -> Self {
        Self {
            job: claim.job.clone(),
            executor: claim.executor,
            error,
            failed_at_ms: now_ms(),
        }
    }
}

/// Queue contract required by the supervisor and executors.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<()>;

    /// Claim the next pending job for `executor`, waiting up to `timeout`.
    /// A zero timeout checks once.
    async fn claim_next(&self, executor: ExecutorId, timeout: Duration)
    -> Result<Option<JobClaim>>;

    /// Resolve a claim successfully. Returns `false` if the claim was
    /// already gone.
    async fn complete(&self, claim: &JobClaim) -> Result<bool>;

    /// Resolve a claim as failed. Returns `false` if the claim was already
    /// gone, in which case no failure is recorded.
    async fn fail(&self, claim: &JobClaim, error: JobError) -> Result<bool>;

    /// Hand a claimed job back unprocessed, ahead of anything enqueued
    /// after it. Returns `false` if the claim was already gone.
    async fn release(&self, claim: &JobClaim) -> Result<bool>;

    /// Whether claimable work exists, waiting up to `timeout` for some to
    /// appear. A zero timeout checks once.
    async fn wait_ready(&self, timeout: Duration) -> Result<bool>;

    /// Snapshot of all outstanding claims.
    async fn claims(&self) -> Result<Vec<JobClaim>>;
}

static JOB_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_job_id() -> JobId {
    let seq = JOB_SEQ.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{nanos:x}-{:x}-{seq:x}", std::process::id())
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
