// src/supervisor/orphan.rs

//! Orphan recovery.
//!
//! A claim is orphaned when the executor holding it is gone without having
//! resolved it: hard-killed during escalation, crashed, or abandoned at a
//! drain deadline. Recovery fails such claims with
//! [`JobError::WorkerTerminated`]. Resolution goes through the queue's
//! compare-and-remove `fail`, so overlapping scans record one failure.

use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::errors::{JobError, Result};
use crate::queue::{JobClaim, JobQueue};
use crate::types::ExecutorId;

pub struct OrphanRecovery {
    queue: Arc<dyn JobQueue>,
    supervisor_pid: u32,
}

impl OrphanRecovery {
    /// `supervisor_pid` identifies claims made by this supervisor's own
    /// executors.
    pub fn new(queue: Arc<dyn JobQueue>, supervisor_pid: u32) -> Self {
        Self {
            queue,
            supervisor_pid,
        }
    }

    /// Fail every claim whose executor is not live. Returns how many claims
    /// this call resolved.
    pub async fn recover(&self, live: Option<ExecutorId>) -> Result<usize> {
        let mut recovered = 0;
        for claim in self.queue.claims().await? {
            if self.is_live(&claim, live) {
                continue;
            }
            let error = JobError::WorkerTerminated {
                executor: claim.executor,
            };
            if self.queue.fail(&claim, error).await? {
                info!(
                    job = %claim.job.id,
                    executor = %claim.executor,
                    "recovered orphaned job"
                );
                recovered += 1;
            } else {
                debug!(job = %claim.job.id, "orphaned claim already resolved");
            }
        }
        Ok(recovered)
    }

    fn is_live(&self, claim: &JobClaim, live: Option<ExecutorId>) -> bool {
        if live == Some(claim.executor) {
            return true;
        }
        if claim.executor.supervisor == self.supervisor_pid {
            // One of our own past executors.
            return false;
        }
        supervisor_alive(claim.executor.supervisor)
    }
}

/// Check whether another supervisor process exists using signal 0.
///
/// Pids that cannot name a single process (0, or beyond `i32::MAX`) count as
/// dead; `kill` would read them as a process group.
fn supervisor_alive(pid: u32) -> bool {
    let raw = match i32::try_from(pid) {
        Ok(raw) if raw > 0 => raw,
        _ => {
            warn!(pid, "claim names an impossible supervisor pid");
            return false;
        }
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        // EPERM: the process exists but belongs to someone else.
        Err(Errno::EPERM) => true,
        Err(errno) => {
            warn!(pid, error = %errno, "could not check supervisor liveness");
            true
        }
    }
}
