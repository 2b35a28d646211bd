use std::error::Error;
use std::sync::Arc;

use multifork::errors::JobError;
use multifork::queue::{Job, JobClaim, MemoryQueue};
use multifork::supervisor::OrphanRecovery;
use multifork::types::{ExecutorId, ExitReason};
use multifork_test_utils::{ConfigFileBuilder, Recorder, init_tracing, queue_with, task_supervisor};

type TestResult = Result<(), Box<dyn Error>>;

#[tokio::test(start_paused = true)]
async fn startup_scan_fails_claims_left_by_a_previous_run() -> TestResult {
    init_tracing();

    let me = std::process::id();
    let queue = queue_with(&["fresh"]);
    let stale = JobClaim::new(Job::new("stale"), ExecutorId::new(me, 42));
    queue.insert_claim(stale.clone());

    let cfg = ConfigFileBuilder::new().build();
    let recorder = Recorder::instant();
    let (mut supervisor, _shutdown) = task_supervisor(&cfg, queue.clone(), recorder.clone());
    let summary = supervisor.run(cfg.worker.interval).await?;

    assert_eq!(summary.orphans_recovered, 1);
    assert_eq!(recorder.jobs(), vec!["fresh"]);

    let failures = queue.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].job.id, stale.job.id);
    assert_eq!(
        failures[0].error,
        JobError::WorkerTerminated {
            executor: ExecutorId::new(me, 42)
        }
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn crashed_executor_is_replaced_by_a_fresh_fork() -> TestResult {
    init_tracing();

    let cfg = ConfigFileBuilder::new().build();
    let queue = queue_with(&["before", "panic", "after"]);
    let recorder = Recorder::instant();

    let (mut supervisor, _shutdown) = task_supervisor(&cfg, queue.clone(), recorder.clone());
    let summary = supervisor.run(cfg.worker.interval).await?;

    assert_eq!(summary.forks, 2);
    assert!(matches!(summary.exits[0].reason, ExitReason::Crashed(_)));
    assert_eq!(summary.exits[1].reason, ExitReason::QueueDrained);
    assert_eq!(recorder.jobs(), vec!["before", "panic", "after"]);
    // The crashed cycle never reached its exit hook.
    assert_eq!(recorder.exit_counts(), vec![1]);

    let failures = queue.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].job.payload, "panic");
    assert_eq!(failures[0].error.as_label(), "worker_terminated");
    assert_eq!(queue.completed().len(), 2);
    Ok(())
}

#[tokio::test]
async fn live_executor_claim_is_left_alone() -> TestResult {
    let me = std::process::id();
    let queue = Arc::new(MemoryQueue::new());
    let live = ExecutorId::new(me, 3);
    queue.insert_claim(JobClaim::new(Job::new("running"), live));

    let recovery = OrphanRecovery::new(queue.clone(), me);
    assert_eq!(recovery.recover(Some(live)).await?, 0);
    assert_eq!(queue.claim_snapshot().len(), 1);

    // Once that executor is gone the same claim is stale.
    assert_eq!(recovery.recover(None).await?, 1);
    assert_eq!(recovery.recover(None).await?, 0);
    assert_eq!(queue.failures().len(), 1);
    Ok(())
}
