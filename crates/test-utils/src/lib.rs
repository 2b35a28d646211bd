pub mod builders;
pub mod recorder;

use std::sync::{Arc, Once};

use multifork::config::ConfigFile;
use multifork::executor::TaskBackend;
use multifork::queue::{Job, MemoryQueue};
use multifork::shutdown::ShutdownController;
use multifork::supervisor::{SupervisorSettings, WorkerSupervisor};
use tracing_subscriber::{EnvFilter, fmt};

pub use builders::ConfigFileBuilder;
pub use recorder::Recorder;

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// - Uses `with_test_writer()`, so logs are captured per-test.
/// - The Rust test harness only prints captured output for **failing** tests
///   (unless you run with `-- --nocapture`).
///
/// Enable levels with e.g.:
/// `RUST_LOG=debug cargo test`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer() // print only for failing tests unless --nocapture
            .with_target(true)
            .init();
    });
}

/// A memory queue holding one job per payload, in order.
pub fn queue_with(payloads: &[&str]) -> Arc<MemoryQueue> {
    let queue = Arc::new(MemoryQueue::new());
    for payload in payloads {
        queue.push(Job::new(*payload));
    }
    queue
}

/// A task-backed supervisor whose hooks and jobs all go through `recorder`.
pub fn task_supervisor(
    cfg: &ConfigFile,
    queue: Arc<MemoryQueue>,
    recorder: Arc<Recorder>,
) -> (WorkerSupervisor<TaskBackend>, ShutdownController) {
    let shutdown = ShutdownController::new(cfg.shutdown);
    let backend = TaskBackend::new(queue.clone(), recorder.clone(), recorder.clone());
    let supervisor = WorkerSupervisor::new(
        backend,
        queue,
        recorder,
        shutdown.clone(),
        cfg.fork,
        SupervisorSettings::from(&cfg.worker),
    );
    (supervisor, shutdown)
}
