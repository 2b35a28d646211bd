#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use multifork::config::{ConfigFile, RawConfigFile};

/// Builder for `ConfigFile` to simplify test setup.
///
/// Starts from the file defaults with a zero poll interval, so a run drains
/// the queue and returns.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        let mut config = RawConfigFile::default();
        config.worker.interval = Duration::ZERO;
        Self { config }
    }

    pub fn seconds_per_fork(mut self, secs: u64) -> Self {
        self.config.fork.seconds_per_fork = Duration::from_secs(secs);
        self
    }

    pub fn jobs_per_fork(mut self, jobs: u64) -> Self {
        self.config.fork.jobs_per_fork = jobs;
        self
    }

    pub fn start_lag(mut self, lag: Duration) -> Self {
        self.config.fork.start_lag = lag;
        self
    }

    pub fn term_child(mut self, val: bool) -> Self {
        self.config.shutdown.term_child = val;
        self
    }

    pub fn graceful_term(mut self, val: bool) -> Self {
        self.config.shutdown.graceful_term = val;
        self
    }

    pub fn term_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown.term_timeout = timeout;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.worker.interval = interval;
        self
    }

    pub fn queue_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.worker.queue_dir = dir.into();
        self
    }

    pub fn max_fork_failures(mut self, n: u32) -> Self {
        self.config.worker.max_fork_failures = n;
        self
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}
