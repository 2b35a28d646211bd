use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use multifork::supervisor::StopReason;
use multifork::types::ExitReason;
use multifork_test_utils::{ConfigFileBuilder, Recorder, init_tracing, queue_with, task_supervisor};

type TestResult = Result<(), Box<dyn Error>>;

#[tokio::test(start_paused = true)]
async fn time_budget_rotates_after_the_job_that_crosses_it() -> TestResult {
    init_tracing();

    let cfg = ConfigFileBuilder::new().seconds_per_fork(3).build();
    let queue = queue_with(&["j1", "j2", "j3", "j4"]);
    let recorder = Arc::new(Recorder::new(Duration::from_secs(2)));

    let (mut supervisor, _shutdown) = task_supervisor(&cfg, queue.clone(), recorder.clone());
    let summary = supervisor.run(cfg.worker.interval).await?;

    assert_eq!(recorder.exit_counts(), vec![3, 1]);
    assert_eq!(summary.forks, 2);
    assert_eq!(summary.jobs_processed, 4);
    assert_eq!(summary.stop, StopReason::QueueEmpty);

    let reasons: Vec<_> = summary.exits.iter().map(|e| e.reason.clone()).collect();
    assert_eq!(reasons, vec![ExitReason::TimeLimit, ExitReason::QueueDrained]);
    assert_eq!(queue.completed().len(), 4);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn job_budget_splits_forty_jobs_into_two_forks() -> TestResult {
    init_tracing();

    let cfg = ConfigFileBuilder::new().jobs_per_fork(20).build();
    let payloads: Vec<String> = (0..40).map(|i| format!("job-{i}")).collect();
    let refs: Vec<&str> = payloads.iter().map(String::as_str).collect();
    let queue = queue_with(&refs);
    let recorder = Recorder::instant();

    let (mut supervisor, _shutdown) = task_supervisor(&cfg, queue.clone(), recorder.clone());
    let summary = supervisor.run(cfg.worker.interval).await?;

    assert_eq!(recorder.exit_counts(), vec![20, 20]);
    assert_eq!(summary.forks, 2);
    assert!(summary.exits.iter().all(|e| e.reason == ExitReason::JobLimit));
    assert_eq!(recorder.jobs(), payloads);
    assert_eq!(queue.pending_len(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failed_jobs_count_toward_the_budget() -> TestResult {
    init_tracing();

    let cfg = ConfigFileBuilder::new().jobs_per_fork(2).build();
    let queue = queue_with(&["fail-1", "ok-1", "ok-2"]);
    let recorder = Recorder::instant();

    let (mut supervisor, _shutdown) = task_supervisor(&cfg, queue.clone(), recorder.clone());
    supervisor.run(cfg.worker.interval).await?;

    assert_eq!(recorder.exit_counts(), vec![2, 1]);
    let failures = queue.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].job.payload, "fail-1");
    assert_eq!(failures[0].error.as_label(), "job_execution");
    assert_eq!(queue.completed().len(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn hooks_bracket_every_cycle() -> TestResult {
    init_tracing();

    let cfg = ConfigFileBuilder::new().jobs_per_fork(1).build();
    let queue = queue_with(&["a", "b"]);
    let recorder = Recorder::instant();

    let (mut supervisor, _shutdown) = task_supervisor(&cfg, queue, recorder.clone());
    supervisor.run(cfg.worker.interval).await?;

    assert_eq!(
        recorder.entries(),
        vec![
            "before_fork",
            "after_fork",
            "job:a",
            "before_child_exit:1",
            "before_fork",
            "after_fork",
            "job:b",
            "before_child_exit:1",
        ]
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn polling_supervisor_forks_when_work_arrives() -> TestResult {
    init_tracing();

    let cfg = ConfigFileBuilder::new()
        .interval(Duration::from_secs(5))
        .build();
    let queue = queue_with(&[]);
    let recorder = Recorder::instant();

    let (mut supervisor, shutdown) = task_supervisor(&cfg, queue.clone(), recorder.clone());

    let producer = {
        let queue = queue.clone();
        let recorder = recorder.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            queue.push(multifork::queue::Job::new("late"));
            while recorder.jobs().is_empty() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            shutdown.request_graceful();
        })
    };

    let summary = supervisor.run(cfg.worker.interval).await?;
    producer.await?;

    assert_eq!(recorder.jobs(), vec!["late"]);
    assert_eq!(summary.stop, StopReason::Shutdown);
    assert_eq!(queue.completed().len(), 1);
    Ok(())
}
