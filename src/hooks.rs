// src/hooks.rs

//! Lifecycle hooks around each fork cycle.
//!
//! Per cycle the order is always `before_fork` (supervisor), `after_fork`
//! (executor), the jobs, then `before_child_exit` (executor). A hard kill
//! skips `before_child_exit`; nothing else does.

use std::os::fd::AsFd;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::HooksConfig;

/// Host callbacks. All methods default to no-ops.
///
/// Each hook is awaited before the cycle moves on. Hooks must not panic.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// Runs in the supervisor right before an executor unit is launched.
    async fn before_fork(&self) {}

    /// Runs inside the new executor unit before it claims anything.
    async fn after_fork(&self) {}

    /// Runs inside the executor unit right before it exits on its own.
    async fn before_child_exit(&self, jobs_processed: u64) {
        let _ = jobs_processed;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl Hooks for NoopHooks {}

/// Runs configured shell commands as hooks.
///
/// `before_child_exit` receives the job count in `MULTIFORK_JOBS_PROCESSED`.
/// An executor process talks to its supervisor over stdin and stdout, so
/// hook commands get a null stdin and their stdout goes to stderr. A
/// failing hook command is logged and otherwise ignored.
#[derive(Debug, Clone, Default)]
pub struct CommandHooks {
    config: HooksConfig,
}

impl CommandHooks {
    pub fn new(config: HooksConfig) -> Self {
        Self { config }
    }

    async fn run(&self, hook: &str, cmd: Option<&str>, jobs_processed: Option<u64>) {
        let Some(cmd) = cmd else {
            return;
        };
        debug!(hook, %cmd, "running hook command");

        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd).stdin(Stdio::null());
        if let Some(n) = jobs_processed {
            command.env("MULTIFORK_JOBS_PROCESSED", n.to_string());
        }
        if let Ok(stderr) = std::io::stderr().as_fd().try_clone_to_owned() {
            command.stdout(Stdio::from(stderr));
        }

        match command.status().await {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(hook, code = ?status.code(), "hook command failed"),
            Err(err) => warn!(hook, error = %err, "hook command could not be started"),
        }
    }
}

#[async_trait]
impl Hooks for CommandHooks {
    async fn before_fork(&self) {
        self.run("before_fork", self.config.before_fork.as_deref(), None)
            .await;
    }

    async fn after_fork(&self) {
        self.run("after_fork", self.config.after_fork.as_deref(), None)
            .await;
    }

    async fn before_child_exit(&self, jobs_processed: u64) {
        self.run(
            "before_child_exit",
            self.config.before_child_exit.as_deref(),
            Some(jobs_processed),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn child_exit_hook_sees_job_count() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("count");
        let hooks = CommandHooks::new(HooksConfig {
            before_fork: None,
            after_fork: None,
            before_child_exit: Some(format!(
                "printf %s \"$MULTIFORK_JOBS_PROCESSED\" > {}",
                out.display()
            )),
        });

        hooks.before_fork().await;
        hooks.before_child_exit(7).await;

        assert_eq!(std::fs::read_to_string(&out).unwrap(), "7");
    }

    #[tokio::test]
    async fn hook_stdin_is_detached() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("stdin");
        let hooks = CommandHooks::new(HooksConfig {
            before_fork: None,
            after_fork: Some(format!("cat > {}", out.display())),
            before_child_exit: None,
        });

        // Reading stdin must hit EOF at once instead of taking our input.
        tokio::time::timeout(std::time::Duration::from_secs(5), hooks.after_fork())
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "");
    }

    #[tokio::test]
    async fn failing_hook_is_not_fatal() {
        let hooks = CommandHooks::new(HooksConfig {
            before_fork: Some("exit 1".into()),
            after_fork: None,
            before_child_exit: None,
        });
        hooks.before_fork().await;
    }
}
