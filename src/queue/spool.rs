// src/queue/spool.rs

//! Directory-backed job queue shared between processes.
//!
//! Layout under the spool root:
//!
//! ```text
//! tmp/                                  staging for atomic writes
//! pending/<enqueued_ms>-<id>.json       Job, FIFO by file name
//! claimed/<executor>__<claimed_ms>__<pending name>
//! done/<id>.json                        Job
//! failed/<id>.json                      FailureRecord
//! rejected/<name>                       files that did not parse
//! ```
//!
//! Every state change is a single `rename(2)` or `unlink(2)`, which is
//! atomic on one filesystem. Claiming renames a pending file into
//! `claimed/`; resolving moves it out again. A move that fails with
//! `NotFound` means another process won the race, which gives
//! compare-and-remove semantics without any lock files.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::fs;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{FailureRecord, Job, JobClaim, JobQueue};
use crate::errors::{JobError, MultiforkError, Result};
use crate::types::ExecutorId;

/// How often an idle claimer or readiness check rescans `pending/`.
const POLL_STEP: Duration = Duration::from_millis(100);

const CLAIM_SEP: &str = "__";

const DIRS: [&str; 6] = ["tmp", "pending", "claimed", "done", "failed", "rejected"];

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

/// Counts per spool directory, for `multifork status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpoolStats {
    pub pending: usize,
    pub claimed: usize,
    pub done: usize,
    pub failed: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone)]
pub struct SpoolQueue {
    root: PathBuf,
}

impl SpoolQueue {
    /// Open (and create if needed) a spool rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in DIRS {
            fs::create_dir_all(root.join(dir)).await?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub async fn stats(&self) -> Result<SpoolStats> {
        Ok(SpoolStats {
            pending: list_json(&self.dir("pending")).await?.len(),
            claimed: list_json(&self.dir("claimed")).await?.len(),
            done: list_json(&self.dir("done")).await?.len(),
            failed: list_json(&self.dir("failed")).await?.len(),
            rejected: list_json(&self.dir("rejected")).await?.len(),
        })
    }

    pub async fn failures(&self) -> Result<Vec<FailureRecord>> {
        let mut out = Vec::new();
        for name in list_json(&self.dir("failed")).await? {
            if let Some(record) = self.read_or_reject(&self.dir("failed").join(&name)).await? {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Write `bytes` under `tmp/` and return the staged path.
    async fn stage(&self, name: &str, bytes: Vec<u8>) -> Result<PathBuf> {
        let seq = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
        let staging = self
            .dir("tmp")
            .join(format!("{name}.{}.{seq}", std::process::id()));
        fs::write(&staging, bytes).await?;
        Ok(staging)
    }

    async fn write_atomic(&self, target: &Path, bytes: Vec<u8>) -> Result<()> {
        let file_name = target
            .file_name()
            .ok_or_else(|| MultiforkError::Queue(format!("invalid spool path {target:?}")))?;
        let staging = self.stage(&file_name.to_string_lossy(), bytes).await?;
        fs::rename(&staging, target).await?;
        Ok(())
    }

    /// Parse a spool file. `None` if it vanished in between, or if it did
    /// not parse, in which case it is moved to `rejected/`.
    async fn read_or_reject<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let err = match serde_json::from_slice(&bytes) {
            Ok(value) => return Ok(Some(value)),
            Err(err) => err,
        };

        warn!(file = %path.display(), error = %err, "rejecting unreadable spool file");
        let Some(name) = path.file_name() else {
            return Ok(None);
        };
        match fs::rename(path, self.dir("rejected").join(name)).await {
            Ok(()) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn try_claim(&self, executor: ExecutorId) -> Result<Option<JobClaim>> {
        for name in list_json(&self.dir("pending")).await? {
            let claimed_at_ms = super::now_ms();
            let claim_name = claim_file_name(executor, claimed_at_ms, &name);
            let claim_path = self.dir("claimed").join(&claim_name);

            match fs::rename(self.dir("pending").join(&name), &claim_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }

            let Some(job) = self.read_or_reject::<Job>(&claim_path).await? else {
                continue;
            };
            debug!(job = %job.id, %executor, "claimed spool job");
            return Ok(Some(JobClaim {
                job,
                executor,
                claimed_at_ms,
            }));
        }
        Ok(None)
    }

    fn claim_path(&self, claim: &JobClaim) -> PathBuf {
        self.dir("claimed").join(claim_file_name(
            claim.executor,
            claim.claimed_at_ms,
            &pending_file_name(&claim.job),
        ))
    }

    /// Move a claim file out of `claimed/`. `Ok(false)` if it was gone.
    async fn take_claim(&self, claim: &JobClaim, to: &Path) -> Result<bool> {
        match fs::rename(self.claim_path(claim), to).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// One claim attempt, run on its own task.
///
/// Renames finish on the blocking pool even when the caller stops waiting,
/// so a claim can land after its future was dropped. Dropping an unfinished
/// attempt hands such a claim back to `pending/`.
struct ClaimAttempt {
    queue: SpoolQueue,
    task: Option<JoinHandle<Result<Option<JobClaim>>>>,
}

impl ClaimAttempt {
    fn start(queue: &SpoolQueue, executor: ExecutorId) -> Self {
        let worker = queue.clone();
        Self {
            queue: queue.clone(),
            task: Some(tokio::spawn(async move { worker.try_claim(executor).await })),
        }
    }

    async fn finish(mut self) -> Result<Option<JobClaim>> {
        let Some(task) = self.task.as_mut() else {
            return Ok(None);
        };
        let joined = task.await;
        self.task = None;
        joined.map_err(|e| MultiforkError::Queue(format!("claim attempt failed: {e}")))?
    }
}

impl Drop for ClaimAttempt {
    fn drop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("claim attempt dropped outside a runtime; a landed claim stays for recovery");
            return;
        };
        let queue = self.queue.clone();
        runtime.spawn(async move {
            let Ok(Ok(Some(claim))) = task.await else {
                return;
            };
            match queue.release(&claim).await {
                Ok(_) => debug!(job = %claim.job.id, "handed back claim of a cancelled attempt"),
                Err(err) => warn!(job = %claim.job.id, error = %err, "could not hand back claim"),
            }
        });
    }
}

#[async_trait]
impl JobQueue for SpoolQueue {
    async fn enqueue(&self, job: Job) -> Result<()> {
        let target = self.dir("pending").join(pending_file_name(&job));
        self.write_atomic(&target, serde_json::to_vec(&job)?).await?;
        debug!(job = %job.id, "enqueued spool job");
        Ok(())
    }

    /// Cancel-safe: a claim that lands after the future was dropped goes
    /// back to `pending/`.
    async fn claim_next(
        &self,
        executor: ExecutorId,
        timeout: Duration,
    ) -> Result<Option<JobClaim>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(claim) = ClaimAttempt::start(self, executor).finish().await? {
                return Ok(Some(claim));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_STEP.min(deadline - now)).await;
        }
    }

    async fn complete(&self, claim: &JobClaim) -> Result<bool> {
        let done = self.dir("done").join(format!("{}.json", claim.job.id));
        self.take_claim(claim, &done).await
    }

    async fn fail(&self, claim: &JobClaim, error: JobError) -> Result<bool> {
        let name = format!("{}.json", claim.job.id);
        let record = FailureRecord::new(claim, error);
        let staged = self.stage(&name, serde_json::to_vec(&record)?).await?;

        // The record only lands in failed/ once the claim is ours to remove.
        match fs::remove_file(self.claim_path(claim)).await {
            Ok(()) => {
                fs::rename(&staged, self.dir("failed").join(&name)).await?;
                Ok(true)
            }
            Err(e) => {
                discard(&staged).await;
                if e.kind() == ErrorKind::NotFound {
                    Ok(false)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    async fn release(&self, claim: &JobClaim) -> Result<bool> {
        let pending = self.dir("pending").join(pending_file_name(&claim.job));
        let released = self.take_claim(claim, &pending).await?;
        if released {
            debug!(job = %claim.job.id, "released spool job");
        }
        Ok(released)
    }

    async fn wait_ready(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if !list_json(&self.dir("pending")).await?.is_empty() {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(POLL_STEP.min(deadline - now)).await;
        }
    }

    async fn claims(&self) -> Result<Vec<JobClaim>> {
        let mut out = Vec::new();
        for name in list_json(&self.dir("claimed")).await? {
            let Some((executor, claimed_at_ms)) = parse_claim_file_name(&name) else {
                warn!(file = %name, "ignoring unrecognised claim file");
                continue;
            };
            if let Some(job) = self.read_or_reject::<Job>(&self.dir("claimed").join(&name)).await? {
                out.push(JobClaim {
                    job,
                    executor,
                    claimed_at_ms,
                });
            }
        }
        Ok(out)
    }
}

fn pending_file_name(job: &Job) -> String {
    format!("{:020}-{}.json", job.enqueued_at_ms, job.id)
}

fn claim_file_name(executor: ExecutorId, claimed_at_ms: u64, pending_name: &str) -> String {
    format!("{executor}{CLAIM_SEP}{claimed_at_ms}{CLAIM_SEP}{pending_name}")
}

fn parse_claim_file_name(name: &str) -> Option<(ExecutorId, u64)> {
    let mut parts = name.splitn(3, CLAIM_SEP);
    let executor = parts.next()?.parse().ok()?;
    let claimed_at_ms = parts.next()?.parse().ok()?;
    parts.next()?;
    Some((executor, claimed_at_ms))
}

async fn discard(staged: &Path) {
    if let Err(e) = fs::remove_file(staged).await {
        warn!(file = %staged.display(), error = %e, "could not remove staged file");
    }
}

/// Sorted `*.json` file names in `dir`.
async fn list_json(dir: &Path) -> Result<Vec<String>> {
    let mut entries = fs::read_dir(dir).await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".json") {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_file_names_round_trip() {
        let job = Job::new("echo hi");
        let name = claim_file_name(ExecutorId::new(12, 3), 99, &pending_file_name(&job));
        assert_eq!(
            parse_claim_file_name(&name),
            Some((ExecutorId::new(12, 3), 99))
        );
        assert_eq!(parse_claim_file_name("junk.json"), None);
    }

    #[tokio::test]
    async fn claim_then_complete_moves_files() {
        let dir = tempfile::tempdir().unwrap();
        let q = SpoolQueue::open(dir.path()).await.unwrap();

        q.enqueue(Job::new("echo one")).await.unwrap();
        assert!(q.wait_ready(Duration::ZERO).await.unwrap());

        let claim = q
            .claim_next(ExecutorId::new(1, 1), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claim.job.payload, "echo one");
        assert_eq!(q.claims().await.unwrap(), vec![claim.clone()]);
        assert!(!q.wait_ready(Duration::ZERO).await.unwrap());

        assert!(q.complete(&claim).await.unwrap());
        assert!(!q.complete(&claim).await.unwrap());

        let stats = q.stats().await.unwrap();
        assert_eq!(
            stats,
            SpoolStats {
                pending: 0,
                claimed: 0,
                done: 1,
                failed: 0,
                rejected: 0,
            }
        );
    }

    #[tokio::test]
    async fn failing_twice_records_once() {
        let dir = tempfile::tempdir().unwrap();
        let q = SpoolQueue::open(dir.path()).await.unwrap();
        q.enqueue(Job::new("false")).await.unwrap();
        let claim = q
            .claim_next(ExecutorId::new(1, 1), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        let orphaned = JobError::WorkerTerminated {
            executor: claim.executor,
        };
        assert!(q.fail(&claim, orphaned.clone()).await.unwrap());
        assert!(!q.fail(&claim, orphaned.clone()).await.unwrap());

        let failures = q.failures().await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error, orphaned);
    }

    #[tokio::test]
    async fn fifo_across_enqueues() {
        let dir = tempfile::tempdir().unwrap();
        let q = SpoolQueue::open(dir.path()).await.unwrap();
        let mut first = Job::new("first");
        first.enqueued_at_ms = 1;
        let mut second = Job::new("second");
        second.enqueued_at_ms = 2;
        q.enqueue(second).await.unwrap();
        q.enqueue(first).await.unwrap();

        let exec = ExecutorId::new(1, 1);
        let a = q.claim_next(exec, Duration::ZERO).await.unwrap().unwrap();
        let b = q.claim_next(exec, Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(a.job.payload, "first");
        assert_eq!(b.job.payload, "second");
    }

    #[tokio::test]
    async fn failing_leaves_nothing_staged() {
        let dir = tempfile::tempdir().unwrap();
        let q = SpoolQueue::open(dir.path()).await.unwrap();
        q.enqueue(Job::new("false")).await.unwrap();
        let claim = q
            .claim_next(ExecutorId::new(1, 1), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        assert!(q.fail(&claim, JobError::Termination).await.unwrap());
        assert!(!q.fail(&claim, JobError::Termination).await.unwrap());

        let staged = std::fs::read_dir(dir.path().join("tmp")).unwrap().count();
        assert_eq!(staged, 0);
        assert_eq!(q.failures().await.unwrap()[0].error, JobError::Termination);
    }

    #[tokio::test]
    async fn released_claim_returns_to_pending_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let q = SpoolQueue::open(dir.path()).await.unwrap();
        let mut first = Job::new("first");
        first.enqueued_at_ms = 1;
        let mut second = Job::new("second");
        second.enqueued_at_ms = 2;
        q.enqueue(first).await.unwrap();
        q.enqueue(second).await.unwrap();

        let claim = q.claim_next(ExecutorId::new(1, 1), Duration::ZERO).await.unwrap().unwrap();
        assert!(q.release(&claim).await.unwrap());
        assert!(!q.release(&claim).await.unwrap());
        assert!(q.claims().await.unwrap().is_empty());

        let again = q.claim_next(ExecutorId::new(1, 2), Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.job.payload, "first");
    }

    #[tokio::test]
    async fn unreadable_files_are_rejected_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let q = SpoolQueue::open(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("pending/00000000000000000000-bad.json"), "not json").unwrap();
        q.enqueue(Job::new("good")).await.unwrap();

        // A stale claim next to a corrupt one is still listed.
        std::fs::write(
            dir.path().join("claimed").join(claim_file_name(ExecutorId::new(9, 1), 5, "x-bad.json")),
            "{",
        )
        .unwrap();
        let stale = q.claim_next(ExecutorId::new(9, 2), Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(stale.job.payload, "good");

        assert_eq!(q.claims().await.unwrap(), vec![stale]);
        let stats = q.stats().await.unwrap();
        assert_eq!(stats.rejected, 2);
        assert_eq!(stats.claimed, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_claims_never_strand_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let q = SpoolQueue::open(dir.path()).await.unwrap();
        let exec = ExecutorId::new(1, 1);

        let rounds = 200;
        for i in 0..rounds {
            q.enqueue(Job::new(format!("job-{i}"))).await.unwrap();
            let attempt = tokio::time::timeout(
                Duration::from_micros(i as u64 * 5),
                q.claim_next(exec, Duration::ZERO),
            )
            .await;
            if let Ok(Ok(Some(claim))) = attempt {
                assert!(q.complete(&claim).await.unwrap());
            }
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(q.claims().await.unwrap().is_empty());
        let stats = q.stats().await.unwrap();
        assert_eq!(stats.pending + stats.done, rounds);
    }
}
