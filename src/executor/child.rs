// src/executor/child.rs

//! `multifork executor`: the process side of the control protocol.
//!
//! Reads the `start` message from stdin, runs one [`ForkedExecutor`] cycle
//! against the spool queue, streams events to stdout and exits. Logs go to
//! stderr like everywhere else. `SIGTERM` is the termination signal; stdin
//! reaching EOF means the supervisor is gone, which is treated as a
//! graceful shutdown request.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConfigFile;
use crate::errors::{MultiforkError, Result};
use crate::hooks::{CommandHooks, Hooks};
use crate::perform::{Perform, ShellPerformer};
use crate::policy::ShutdownPolicy;
use crate::queue::{JobQueue, SpoolQueue};
use crate::shutdown::{ShutdownController, ShutdownState, signals};
use crate::types::ExitReport;

use super::forked::{ExecutorControl, ForkedExecutor};
use super::protocol::{ControlMessage, decode_line, encode_line};

/// Entry point of the executor process.
pub async fn run_executor_main(config: &ConfigFile) -> Result<()> {
    let term = CancellationToken::new();
    let _sigterm = signals::cancel_on_sigterm(term.clone())?;

    let queue: Arc<dyn JobQueue> = Arc::new(SpoolQueue::open(&config.worker.queue_dir).await?);
    let performer: Arc<dyn Perform> = Arc::new(ShellPerformer::in_caller_group());
    let hooks: Arc<dyn Hooks> = Arc::new(CommandHooks::new(config.hooks.clone()));

    let report = serve(
        tokio::io::stdin(),
        tokio::io::stdout(),
        term,
        queue,
        performer,
        hooks,
    )
    .await?;
    debug!(executor = %report.executor, reason = report.reason.as_label(), "executor process done");
    Ok(())
}

/// Run one fork cycle driven by control messages on `input`, reporting
/// events on `output`.
pub async fn serve<R, W>(
    input: R,
    output: W,
    term: CancellationToken,
    queue: Arc<dyn JobQueue>,
    performer: Arc<dyn Perform>,
    hooks: Arc<dyn Hooks>,
) -> Result<ExitReport>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(input).lines();
    let first = lines.next_line().await?.ok_or_else(|| {
        MultiforkError::Protocol("stdin closed before the start message".into())
    })?;
    let ControlMessage::Start {
        executor,
        fork,
        shutdown: initial,
        poll_interval_ms,
    } = decode_line::<ControlMessage>(&first)?
    else {
        return Err(MultiforkError::Protocol(format!(
            "expected a start message, got '{}'",
            first.trim()
        )));
    };

    let shutdown = ShutdownController::new(ShutdownPolicy::default());
    shutdown.advance_to(initial);
    let (drain, drain_rx) = watch::channel(None);
    let control = ExecutorControl::new(shutdown.subscribe(), drain_rx, term);

    let reader = tokio::spawn(read_control(lines, shutdown, drain));

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(async move {
        let mut output = output;
        while let Some(event) = events_rx.recv().await {
            let line = encode_line(&event)?;
            output.write_all(line.as_bytes()).await?;
            output.flush().await?;
        }
        Ok::<_, MultiforkError>(())
    });

    let executor = ForkedExecutor::new(
        executor,
        fork,
        Duration::from_millis(poll_interval_ms),
        queue,
        performer,
        hooks,
    );
    let report = executor.run(control, events_tx).await;

    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %err, "writing executor events failed"),
        Err(err) => warn!(error = %err, "executor event writer panicked"),
    }
    reader.abort();

    Ok(report)
}

async fn read_control<R>(
    mut lines: Lines<BufReader<R>>,
    shutdown: ShutdownController,
    drain: watch::Sender<Option<Duration>>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => {
                info!("supervisor closed the control channel; finishing up");
                shutdown.advance_to(ShutdownState::GracefulRequested);
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match decode_line::<ControlMessage>(&line) {
            Ok(ControlMessage::Shutdown { state }) => {
                debug!(?state, "shutdown state from supervisor");
                shutdown.advance_to(state);
            }
            Ok(ControlMessage::Drain { grace_ms }) => {
                debug!(grace_ms, "drain requested by supervisor");
                drain.send_if_modified(|current| {
                    if current.is_none() {
                        *current = Some(Duration::from_millis(grace_ms));
                        true
                    } else {
                        false
                    }
                });
            }
            Ok(ControlMessage::Start { .. }) => warn!("ignoring repeated start message"),
            Err(err) => warn!(error = %err, "ignoring control input"),
        }
    }
}
