use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use multifork::hooks::Hooks;
use multifork::perform::Perform;
use multifork::queue::Job;
use tracing::debug;

/// Hooks and performer in one, recording every call in order.
///
/// Entries look like `before_fork`, `after_fork`, `job:<payload>` (logged
/// when the job starts) and `before_child_exit:<n>`. Jobs sleep for their
/// configured duration; payloads starting with `fail` then return an error
/// and the payload `panic` panics.
pub struct Recorder {
    log: Mutex<Vec<String>>,
    job_duration: Duration,
    overrides: HashMap<String, Duration>,
}

impl Recorder {
    pub fn new(job_duration: Duration) -> Self {
        Self {
            log: Mutex::new(Vec::new()),
            job_duration,
            overrides: HashMap::new(),
        }
    }

    pub fn instant() -> Arc<Self> {
        Arc::new(Self::new(Duration::ZERO))
    }

    /// Give one payload its own duration.
    pub fn with_job_duration(mut self, payload: &str, duration: Duration) -> Self {
        self.overrides.insert(payload.to_string(), duration);
        self
    }

    pub fn entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Job counts reported to `before_child_exit`, one per cycle.
    pub fn exit_counts(&self) -> Vec<u64> {
        self.entries()
            .iter()
            .filter_map(|e| e.strip_prefix("before_child_exit:"))
            .filter_map(|n| n.parse().ok())
            .collect()
    }

    /// Payloads in the order their jobs started.
    pub fn jobs(&self) -> Vec<String> {
        self.entries()
            .iter()
            .filter_map(|e| e.strip_prefix("job:"))
            .map(str::to_string)
            .collect()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }

    fn push(&self, entry: String) {
        debug!(%entry, "recorded");
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl Hooks for Recorder {
    async fn before_fork(&self) {
        self.push("before_fork".into());
    }

    async fn after_fork(&self) {
        self.push("after_fork".into());
    }

    async fn before_child_exit(&self, jobs_processed: u64) {
        self.push(format!("before_child_exit:{jobs_processed}"));
    }
}

#[async_trait]
impl Perform for Recorder {
    async fn perform(&self, job: &Job) -> Result<(), String> {
        self.push(format!("job:{}", job.payload));
        let duration = self
            .overrides
            .get(&job.payload)
            .copied()
            .unwrap_or(self.job_duration);
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
        if job.payload == "panic" {
            panic!("job {} panicked on purpose", job.id);
        }
        if job.payload.starts_with("fail") {
            return Err(format!("{} failed on purpose", job.payload));
        }
        Ok(())
    }
}
