// src/config/model.rs

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::config::humantime_serde;
use crate::policy::{ForkPolicy, ShutdownPolicy};

/// Configuration as read from TOML, before validation.
///
/// ```toml
/// [worker]
/// queue_dir = ".multifork"
/// interval = "5s"
///
/// [fork]
/// seconds_per_fork = "60s"
/// jobs_per_fork = 100
///
/// [shutdown]
/// term_child = true
/// term_timeout = "4s"
///
/// [hooks]
/// before_child_exit = "echo done"
/// ```
///
/// Every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub worker: WorkerSection,

    #[serde(default)]
    pub fork: ForkSection,

    #[serde(default)]
    pub shutdown: ShutdownSection,

    #[serde(default)]
    pub hooks: HooksConfig,
}

/// `[worker]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSection {
    /// Spool directory of the bundled queue.
    #[serde(default = "default_queue_dir")]
    pub queue_dir: PathBuf,

    /// Poll interval; zero drains the queue and exits.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// How long a launched executor process has to report `ready`.
    #[serde(default = "default_handshake_timeout", with = "humantime_serde")]
    pub handshake_timeout: Duration,

    #[serde(default = "default_fork_retry_delay", with = "humantime_serde")]
    pub fork_retry_delay: Duration,

    /// Consecutive launch failures tolerated before `work` gives up.
    #[serde(default = "default_max_fork_failures")]
    pub max_fork_failures: u32,
}

fn default_queue_dir() -> PathBuf {
    PathBuf::from(".multifork")
}

const fn default_interval() -> Duration {
    Duration::from_secs(5)
}

const fn default_handshake_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_fork_retry_delay() -> Duration {
    Duration::from_secs(1)
}

const fn default_max_fork_failures() -> u32 {
    5
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            queue_dir: default_queue_dir(),
            interval: default_interval(),
            handshake_timeout: default_handshake_timeout(),
            fork_retry_delay: default_fork_retry_delay(),
            max_fork_failures: default_max_fork_failures(),
        }
    }
}

/// `[fork]` section. Zero budgets mean unlimited.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ForkSection {
    #[serde(default, with = "humantime_serde")]
    pub seconds_per_fork: Duration,

    #[serde(default)]
    pub jobs_per_fork: u64,

    #[serde(default, with = "humantime_serde")]
    pub start_lag: Duration,
}

/// `[shutdown]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownSection {
    #[serde(default)]
    pub term_child: bool,

    #[serde(default)]
    pub graceful_term: bool,

    #[serde(default = "default_term_timeout", with = "humantime_serde")]
    pub term_timeout: Duration,
}

const fn default_term_timeout() -> Duration {
    Duration::from_secs(4)
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self {
            term_child: false,
            graceful_term: false,
            term_timeout: default_term_timeout(),
        }
    }
}

/// `[hooks]` section: optional shell commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HooksConfig {
    pub before_fork: Option<String>,
    pub after_fork: Option<String>,
    /// Receives the job count in `MULTIFORK_JOBS_PROCESSED`.
    pub before_child_exit: Option<String>,
}

/// Worker settings after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub queue_dir: PathBuf,
    pub interval: Duration,
    pub handshake_timeout: Duration,
    pub fork_retry_delay: Duration,
    pub max_fork_failures: u32,
}

/// Validated configuration. Build it with `ConfigFile::try_from(raw)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    pub worker: WorkerSettings,
    pub fork: ForkPolicy,
    pub shutdown: ShutdownPolicy,
    pub hooks: HooksConfig,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(raw: RawConfigFile) -> Self {
        let RawConfigFile {
            worker,
            fork,
            shutdown,
            hooks,
        } = raw;

        Self {
            worker: WorkerSettings {
                queue_dir: worker.queue_dir,
                interval: worker.interval,
                handshake_timeout: worker.handshake_timeout,
                fork_retry_delay: worker.fork_retry_delay,
                max_fork_failures: worker.max_fork_failures,
            },
            fork: ForkPolicy {
                max_seconds_per_fork: fork.seconds_per_fork,
                max_jobs_per_fork: fork.jobs_per_fork,
                start_lag: fork.start_lag,
            },
            shutdown: ShutdownPolicy {
                term_child: shutdown.term_child,
                graceful_term: shutdown.graceful_term,
                term_timeout: shutdown.term_timeout,
            },
            hooks,
        }
    }
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self::new_unchecked(RawConfigFile::default())
    }
}
