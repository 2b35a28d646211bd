// src/executor/process.rs

//! Executor units as separate OS processes.
//!
//! Each fork cycle re-executes the current binary in executor mode
//! (`multifork executor`). The child gets its own process group so a
//! terminal Ctrl-C reaches only the supervisor, which then decides what
//! happens to the child. Control messages travel as JSON lines on the
//! child's stdin/stdout; see [`super::protocol`].
//!
//! - termination: `SIGTERM` to the child
//! - hard kill: `SIGKILL` to the child's whole process group, so job
//!   subprocesses die with it
//!
//! Once a child's event stream ends, whatever is left in its process group
//! (subprocesses of an abandoned job) is killed as well.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::errors::{MultiforkError, Result};
use crate::shutdown::ShutdownState;
use crate::types::{ExecutorId, ExitReason, ExitReport};

use super::backend::{ExecutorBackend, ExecutorUnit, LaunchRequest, UnitFuture, UnitProgress};
use super::protocol::{ControlMessage, ExecutorEvent, decode_line, encode_line, millis};

/// Launches executor processes and performs the startup handshake.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    program: PathBuf,
    args: Vec<OsString>,
    handshake_timeout: Duration,
}

impl ProcessBackend {
    pub fn new(program: PathBuf, args: Vec<OsString>, handshake_timeout: Duration) -> Self {
        Self {
            program,
            args,
            handshake_timeout,
        }
    }

    /// Re-execute the running binary as `<exe> --config <path> executor`.
    pub fn current_exe(config_path: &Path, handshake_timeout: Duration) -> Result<Self> {
        let program = std::env::current_exe()?;
        let args = vec![
            OsString::from("--config"),
            config_path.as_os_str().to_os_string(),
            OsString::from("executor"),
        ];
        Ok(Self::new(program, args, handshake_timeout))
    }
}

impl ExecutorBackend for ProcessBackend {
    fn launch(
        &mut self,
        request: LaunchRequest,
    ) -> UnitFuture<'_, Result<Box<dyn ExecutorUnit>>> {
        Box::pin(async move {
            let mut cmd = Command::new(&self.program);
            cmd.args(&self.args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .kill_on_drop(true)
                .process_group(0);

            let mut child = cmd.spawn().map_err(|e| {
                MultiforkError::Launch(format!("spawning {}: {e}", self.program.display()))
            })?;
            let pid = child.id();
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| MultiforkError::Launch("executor stdin not captured".into()))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| MultiforkError::Launch("executor stdout not captured".into()))?;

            let mut unit = ProcessUnit {
                progress: UnitProgress::new(request.executor),
                child,
                pid,
                stdin: Some(stdin),
                lines: BufReader::new(stdout).lines(),
                eof: false,
                killed: false,
                exit: None,
            };

            let start = ControlMessage::Start {
                executor: request.executor,
                fork: request.fork,
                shutdown: request.shutdown,
                poll_interval_ms: millis(request.poll_interval),
            };

            let handshake = async {
                unit.send(&start).await?;
                unit.await_ready().await
            };
            let outcome = tokio::time::timeout(self.handshake_timeout, handshake).await;
            match outcome {
                Ok(Ok(())) => {
                    info!(executor = %request.executor, ?pid, "executor process ready");
                    Ok(Box::new(unit) as Box<dyn ExecutorUnit>)
                }
                Ok(Err(err)) => {
                    unit.abandon();
                    Err(MultiforkError::Launch(format!("executor handshake failed: {err}")))
                }
                Err(_) => {
                    unit.abandon();
                    Err(MultiforkError::Launch(format!(
                        "executor did not report ready within {:?}",
                        self.handshake_timeout
                    )))
                }
            }
        })
    }
}

struct ProcessUnit {
    progress: UnitProgress,
    child: Child,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    lines: Lines<BufReader<ChildStdout>>,
    eof: bool,
    killed: bool,
    exit: Option<ExitReport>,
}

impl ProcessUnit {
    async fn send(&mut self, msg: &ControlMessage) -> Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(MultiforkError::Protocol("executor stdin closed".into()));
        };
        let line = encode_line(msg)?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Send a control message, tolerating a child that already went away.
    async fn send_best_effort(&mut self, msg: ControlMessage) -> Result<()> {
        if let Err(err) = self.send(&msg).await {
            debug!(executor = %self.progress.id, error = %err, ?msg, "control message not delivered");
            self.stdin = None;
        }
        Ok(())
    }

    async fn await_ready(&mut self) -> Result<()> {
        while !self.progress.ready {
            match self.lines.next_line().await? {
                Some(line) => self.handle_line(&line),
                None => {
                    self.eof = true;
                    return Err(MultiforkError::Protocol(
                        "executor exited before reporting ready".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn handle_line(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        match decode_line::<ExecutorEvent>(line) {
            Ok(event) => self.progress.observe(event),
            Err(err) => warn!(executor = %self.progress.id, error = %err, "ignoring executor output"),
        }
    }

    fn signal(&self, signal: Signal, group: bool) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        let Some(pid) = self.pid.and_then(|pid| i32::try_from(pid).ok()) else {
            return Ok(());
        };
        let pid = Pid::from_raw(pid);
        let res = if group {
            killpg(pid, signal)
        } else {
            kill(pid, signal)
        };
        match res {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(std::io::Error::from(errno).into()),
        }
    }

    /// Tear down a unit that never became ready.
    fn abandon(&mut self) {
        if let Err(err) = self.signal(Signal::SIGKILL, true) {
            warn!(executor = %self.progress.id, error = %err, "failed to kill executor process");
        }
    }
}

impl ExecutorUnit for ProcessUnit {
    fn id(&self) -> ExecutorId {
        self.progress.id
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_ready(&self) -> bool {
        self.progress.ready
    }

    fn processed(&self) -> u64 {
        self.progress.processed
    }

    fn wait(&mut self) -> UnitFuture<'_, ExitReport> {
        Box::pin(async move {
            if let Some(report) = &self.exit {
                return report.clone();
            }

            // Read the event stream to the end first so `exiting` is never
            // lost to a race with process exit.
            while !self.eof {
                match self.lines.next_line().await {
                    Ok(Some(line)) => self.handle_line(&line),
                    Ok(None) => self.eof = true,
                    Err(err) => {
                        warn!(executor = %self.progress.id, error = %err, "reading executor output failed");
                        self.eof = true;
                    }
                }
            }

            // The child is not reaped yet, so its group id cannot have been
            // reused.
            if let Err(err) = self.signal(Signal::SIGKILL, true) {
                warn!(executor = %self.progress.id, error = %err, "failed to clear executor process group");
            }

            let fallback = match self.child.wait().await {
                Ok(_) if self.killed => ExitReason::Killed,
                Ok(status) => ExitReason::Crashed(describe_status(status)),
                Err(err) => ExitReason::Crashed(format!("waiting for executor failed: {err}")),
            };
            self.stdin = None;

            let report = self.progress.finish(fallback);
            debug!(executor = %report.executor, reason = report.reason.as_label(), "executor process reaped");
            self.exit = Some(report.clone());
            report
        })
    }

    fn notify(&mut self, state: ShutdownState) -> UnitFuture<'_, Result<()>> {
        Box::pin(self.send_best_effort(ControlMessage::Shutdown { state }))
    }

    fn drain(&mut self, grace: Duration) -> UnitFuture<'_, Result<()>> {
        Box::pin(self.send_best_effort(ControlMessage::Drain {
            grace_ms: millis(grace),
        }))
    }

    fn terminate(&mut self) -> Result<()> {
        self.signal(Signal::SIGTERM, false)
    }

    fn kill(&mut self) -> Result<()> {
        self.killed = true;
        self.signal(Signal::SIGKILL, true)
    }
}

fn describe_status(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exited with status {code} without an exit report"),
        (None, Some(sig)) => format!("killed by signal {sig}"),
        (None, None) => "exited without an exit report".to_string(),
    }
}
