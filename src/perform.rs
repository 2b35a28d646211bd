// src/perform.rs

//! Job execution.
//!
//! A [`Perform`] implementation turns a claimed job into work. Its future
//! may be dropped at any await point when the executor is terminated or a
//! drain deadline passes, so implementations must not leave anything
//! behind when dropped.

use std::process::Stdio;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::queue::Job;

#[async_trait]
pub trait Perform: Send + Sync {
    /// Run `job` to completion. `Err` carries the failure message recorded
    /// against the job.
    async fn perform(&self, job: &Job) -> Result<(), String>;
}

/// Runs each payload as a shell command with `sh -c`.
///
/// Output is forwarded to the log at debug level. A non-zero exit status
/// fails the job. The `sh` child is killed if the job future is dropped.
#[derive(Debug, Clone)]
pub struct ShellPerformer {
    own_group: bool,
}

impl ShellPerformer {
    /// Each job gets its own process group, killed as a whole when the job
    /// future is dropped.
    pub fn isolated() -> Self {
        Self { own_group: true }
    }

    /// Jobs stay in the caller's process group. Used inside executor
    /// processes, whose group the supervisor kills after the executor ends.
    pub fn in_caller_group() -> Self {
        Self { own_group: false }
    }
}

impl Default for ShellPerformer {
    fn default() -> Self {
        Self::isolated()
    }
}

#[async_trait]
impl Perform for ShellPerformer {
    async fn perform(&self, job: &Job) -> Result<(), String> {
        info!(job = %job.id, cmd = %job.payload, "running job");

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&job.payload)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if self.own_group {
            command.process_group(0);
        }
        let mut child = command
            .spawn()
            .map_err(|e| format!("spawning job command: {e}"))?;
        let mut group = GroupGuard::new(child.id().filter(|_| self.own_group));

        // Drain both pipes so a chatty job never blocks on a full buffer.
        if let Some(stdout) = child.stdout.take() {
            let job_id = job.id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(job = %job_id, "stdout: {}", line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let job_id = job.id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(job = %job_id, "stderr: {}", line);
                }
            });
        }

        let status = child
            .wait()
            .await
            .map_err(|e| format!("waiting for job command: {e}"))?;
        group.disarm();

        if status.success() {
            Ok(())
        } else {
            match status.code() {
                Some(code) => Err(format!("command exited with status {code}")),
                None => Err("command killed by signal".to_string()),
            }
        }
    }
}

/// SIGKILLs a job's process group unless disarmed first.
struct GroupGuard {
    pgid: Option<Pid>,
}

impl GroupGuard {
    fn new(pid: Option<u32>) -> Self {
        let pgid = pid
            .and_then(|pid| i32::try_from(pid).ok())
            .map(Pid::from_raw);
        Self { pgid }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(errno) => warn!(pgid = pgid.as_raw(), error = %errno, "killing job process group failed"),
        }
    }
}
