// src/queue/memory.rs

//! In-process job queue.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::{FailureRecord, Job, JobClaim, JobQueue};
use crate::errors::{JobError, Result};
use crate::types::{ExecutorId, JobId};

#[derive(Debug, Default)]
struct Inner {
    pending: VecDeque<Job>,
    claims: HashMap<JobId, JobClaim>,
    completed: Vec<JobId>,
    failed: Vec<FailureRecord>,
}

/// FIFO queue with a claim table, completion log and failure log.
///
/// Locks are never held across an `.await`.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue without going through the async trait (test setup).
    pub fn push(&self, job: Job) {
        self.lock().pending.push_back(job);
        self.notify.notify_waiters();
    }

    /// Insert a claim directly, as if `executor` had dequeued `job`.
    pub fn insert_claim(&self, claim: JobClaim) {
        self.lock().claims.insert(claim.job.id.clone(), claim);
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn completed(&self) -> Vec<JobId> {
        self.lock().completed.clone()
    }

    pub fn failures(&self) -> Vec<FailureRecord> {
        self.lock().failed.clone()
    }

    pub fn claim_snapshot(&self) -> Vec<JobClaim> {
        self.lock().claims.values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means a panicking test thread; the data is
        // still consistent because every mutation is a single step.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_claim(&self, executor: ExecutorId) -> Option<JobClaim> {
        let mut inner = self.lock();
        let job = inner.pending.pop_front()?;
        let claim = JobClaim::new(job, executor);
        inner.claims.insert(claim.job.id.clone(), claim.clone());
        Some(claim)
    }

    /// Wait for `cond` to hold, re-checking on every enqueue.
    async fn wait_until<T>(
        &self,
        timeout: Duration,
        mut check: impl FnMut(&Self) -> Option<T>,
    ) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(found) = check(self) {
                return Some(found);
            }
            if timeout.is_zero() {
                return None;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: Job) -> Result<()> {
        debug!(job = %job.id, "enqueued job");
        self.push(job);
        Ok(())
    }

    async fn claim_next(
        &self,
        executor: ExecutorId,
        timeout: Duration,
    ) -> Result<Option<JobClaim>> {
        Ok(self.wait_until(timeout, |q| q.try_claim(executor)).await)
    }

    async fn complete(&self, claim: &JobClaim) -> Result<bool> {
        let mut inner = self.lock();
        if inner.claims.remove(&claim.job.id).is_none() {
            return Ok(false);
        }
        inner.completed.push(claim.job.id.clone());
        Ok(true)
    }

    async fn fail(&self, claim: &JobClaim, error: JobError) -> Result<bool> {
        let mut inner = self.lock();
        if inner.claims.remove(&claim.job.id).is_none() {
            return Ok(false);
        }
        inner.failed.push(FailureRecord::new(claim, error));
        Ok(true)
    }

    async fn release(&self, claim: &JobClaim) -> Result<bool> {
        {
            let mut inner = self.lock();
            if inner.claims.remove(&claim.job.id).is_none() {
                return Ok(false);
            }
            inner.pending.push_front(claim.job.clone());
        }
        self.notify.notify_waiters();
        Ok(true)
    }

    async fn wait_ready(&self, timeout: Duration) -> Result<bool> {
        let ready = self
            .wait_until(timeout, |q| (!q.lock().pending.is_empty()).then_some(()))
            .await;
        Ok(ready.is_some())
    }

    async fn claims(&self) -> Result<Vec<JobClaim>> {
        Ok(self.claim_snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec(seq: u64) -> ExecutorId {
        ExecutorId::new(1, seq)
    }

    #[tokio::test]
    async fn claims_in_fifo_order() {
        let q = MemoryQueue::new();
        let a = Job::new("a");
        let b = Job::new("b");
        q.push(a.clone());
        q.push(b.clone());

        let first = q.claim_next(exec(1), Duration::ZERO).await.unwrap().unwrap();
        let second = q.claim_next(exec(1), Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.job, a);
        assert_eq!(second.job, b);
        assert!(q.claim_next(exec(1), Duration::ZERO).await.unwrap().is_none());
        assert_eq!(q.claim_snapshot().len(), 2);
    }

    #[tokio::test]
    async fn resolving_a_claim_twice_has_no_effect() {
        let q = MemoryQueue::new();
        q.push(Job::new("a"));
        let claim = q.claim_next(exec(1), Duration::ZERO).await.unwrap().unwrap();

        assert!(q.fail(&claim, JobError::Termination).await.unwrap());
        assert!(!q.fail(&claim, JobError::Termination).await.unwrap());
        assert!(!q.complete(&claim).await.unwrap());

        assert_eq!(q.failures().len(), 1);
        assert!(q.completed().is_empty());
        assert!(q.claim_snapshot().is_empty());
    }

    #[tokio::test]
    async fn released_job_is_claimed_first() {
        let q = MemoryQueue::new();
        q.push(Job::new("a"));
        q.push(Job::new("b"));
        let claim = q.claim_next(exec(1), Duration::ZERO).await.unwrap().unwrap();

        assert!(q.release(&claim).await.unwrap());
        assert!(!q.release(&claim).await.unwrap());
        assert!(q.claim_snapshot().is_empty());

        let again = q.claim_next(exec(2), Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.job, claim.job);
        assert_eq!(again.executor, exec(2));
    }

    #[tokio::test(start_paused = true)]
    async fn claim_waits_for_enqueue() {
        let q = std::sync::Arc::new(MemoryQueue::new());
        let producer = q.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            producer.enqueue(Job::new("late")).await.unwrap();
        });

        let claim = q.claim_next(exec(2), Duration::from_secs(5)).await.unwrap();
        assert_eq!(claim.map(|c| c.job.payload), Some("late".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_ready_times_out_on_empty_queue() {
        let q = MemoryQueue::new();
        let start = Instant::now();
        assert!(!q.wait_ready(Duration::from_secs(2)).await.unwrap());
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(!q.wait_ready(Duration::ZERO).await.unwrap());
    }
}
