// src/shutdown/signals.rs

//! # OS signal listener.
//!
//! Maps process signals onto [`ShutdownController`] triggers:
//! - `SIGINT`  → [`ShutdownTrigger::Interrupt`]
//! - `SIGTERM` → [`ShutdownTrigger::Terminate`]
//! - `SIGQUIT` → [`ShutdownTrigger::Graceful`]
//!
//! The listener keeps running after the first signal so a later signal can
//! escalate a graceful shutdown. It only performs state transitions.
//!
//! Executor processes use [`cancel_on_sigterm`] instead: there `SIGTERM` is
//! the termination signal from the supervisor.

use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{ShutdownController, ShutdownTrigger};

/// Background signal listener. Stops listening when dropped.
pub struct SignalListener {
    handle: JoinHandle<()>,
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Install handlers for `SIGINT`, `SIGTERM` and `SIGQUIT`.
///
/// Returns `Err` if signal registration fails; once installed the listener
/// itself cannot fail.
pub fn listen(controller: ShutdownController) -> std::io::Result<SignalListener> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    let handle = tokio::spawn(async move {
        loop {
            let trigger = tokio::select! {
                Some(()) = sigint.recv()  => ShutdownTrigger::Interrupt,
                Some(()) = sigterm.recv() => ShutdownTrigger::Terminate,
                Some(()) = sigquit.recv() => ShutdownTrigger::Graceful,
                else => break,
            };
            info!(?trigger, "received shutdown signal");
            controller.trigger(trigger);
        }
    });

    Ok(SignalListener { handle })
}

/// Cancel `token` on the first `SIGTERM`.
pub fn cancel_on_sigterm(token: CancellationToken) -> std::io::Result<SignalListener> {
    let mut sigterm = signal(SignalKind::terminate())?;

    let handle = tokio::spawn(async move {
        if sigterm.recv().await.is_some() {
            info!("received SIGTERM; terminating executor");
            token.cancel();
        }
    });

    Ok(SignalListener { handle })
}
