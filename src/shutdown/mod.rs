// src/shutdown/mod.rs

//! Shutdown state machine.
//!
//! [`ShutdownController`] holds the single, monotonic [`ShutdownState`] of a
//! supervisor run. Triggers (explicit graceful call, `SIGINT`, `SIGTERM`,
//! `SIGQUIT`) are mapped to a target state plus a [`ShutdownAction`] by
//! [`plan`], combined with the run's [`ShutdownPolicy`]:
//!
//! ```text
//! trigger              term_child  graceful_term   state              action
//! graceful / SIGQUIT   any         any             GracefulRequested  Cooperative
//! SIGINT / SIGTERM     false       any             Terminated         Kill
//! SIGINT               true        any             ForceRequested     Escalate(term_timeout)
//! SIGTERM              true        false           ForceRequested     Escalate(term_timeout)
//! SIGTERM              true        true            GracefulRequested  Drain(term_timeout)
//! ```
//!
//! Requesting a transition never blocks: it is a `watch` update that only
//! succeeds if the target is strictly above the current state. Everything
//! that waits (timeouts, escalation) lives in the supervisor loop.

pub mod signals;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::policy::ShutdownPolicy;

/// Process-wide shutdown state for one supervisor run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownState {
    Running,
    GracefulRequested,
    ForceRequested,
    Terminated,
}

impl ShutdownState {
    /// Executors stop claiming at or above this state.
    pub fn stops_claiming(self) -> bool {
        self >= ShutdownState::GracefulRequested
    }
}

/// Source of a shutdown request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownTrigger {
    /// Explicit API call or `SIGQUIT`.
    Graceful,
    /// `SIGINT`.
    Interrupt,
    /// `SIGTERM`.
    Terminate,
}

/// What the supervisor must do to the live executor for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownAction {
    /// Let the running job finish; the executor leaves between jobs.
    Cooperative,
    /// Stop claiming; the in-flight job gets `grace` before it is abandoned.
    Drain { grace: Duration },
    /// Wait `after` for a voluntary exit, then send the termination signal.
    Escalate { after: Duration },
    /// Kill the executor outright.
    Kill,
}

/// Snapshot published on every accepted transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownStatus {
    pub state: ShutdownState,
    /// Action attached to the transition that produced `state`.
    pub action: Option<ShutdownAction>,
}

impl ShutdownStatus {
    fn running() -> Self {
        Self {
            state: ShutdownState::Running,
            action: None,
        }
    }
}

/// Map a trigger to its target state and action under `policy`.
pub fn plan(policy: &ShutdownPolicy, trigger: ShutdownTrigger) -> (ShutdownState, ShutdownAction) {
    match trigger {
        ShutdownTrigger::Graceful => {
            (ShutdownState::GracefulRequested, ShutdownAction::Cooperative)
        }
        ShutdownTrigger::Interrupt | ShutdownTrigger::Terminate if !policy.term_child => {
            (ShutdownState::Terminated, ShutdownAction::Kill)
        }
        ShutdownTrigger::Terminate if policy.graceful_term => (
            ShutdownState::GracefulRequested,
            ShutdownAction::Drain {
                grace: policy.term_timeout,
            },
        ),
        ShutdownTrigger::Interrupt | ShutdownTrigger::Terminate => (
            ShutdownState::ForceRequested,
            ShutdownAction::Escalate {
                after: policy.term_timeout,
            },
        ),
    }
}

/// Owner of the shutdown state. Cheap to clone; all clones share state.
#[derive(Clone, Debug)]
pub struct ShutdownController {
    policy: ShutdownPolicy,
    tx: Arc<watch::Sender<ShutdownStatus>>,
}

impl ShutdownController {
    pub fn new(policy: ShutdownPolicy) -> Self {
        let (tx, _rx) = watch::channel(ShutdownStatus::running());
        Self {
            policy,
            tx: Arc::new(tx),
        }
    }

    pub fn policy(&self) -> &ShutdownPolicy {
        &self.policy
    }

    pub fn state(&self) -> ShutdownState {
        self.tx.borrow().state
    }

    pub fn status(&self) -> ShutdownStatus {
        *self.tx.borrow()
    }

    /// Cooperative stop: the current job finishes, nothing new is claimed.
    pub fn request_graceful(&self) -> bool {
        self.trigger(ShutdownTrigger::Graceful)
    }

    /// Apply a trigger. Returns `false` if it would not advance the state.
    pub fn trigger(&self, trigger: ShutdownTrigger) -> bool {
        let (state, action) = plan(&self.policy, trigger);
        let accepted = self.advance(state, Some(action));
        if accepted {
            info!(?trigger, ?state, ?action, "shutdown requested");
        } else {
            debug!(?trigger, current = ?self.state(), "shutdown trigger ignored; state already at or past target");
        }
        accepted
    }

    /// Advance to `state` without an action (e.g. final `Terminated`, or a
    /// state mirrored from the supervisor into an executor process).
    pub fn advance_to(&self, state: ShutdownState) -> bool {
        self.advance(state, None)
    }

    fn advance(&self, state: ShutdownState, action: Option<ShutdownAction>) -> bool {
        self.tx.send_if_modified(|status| {
            if state > status.state {
                *status = ShutdownStatus { state, action };
                true
            } else {
                false
            }
        })
    }

    pub fn subscribe(&self) -> ShutdownWatch {
        ShutdownWatch {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read side handed to supervisor loops and executors.
#[derive(Clone, Debug)]
pub struct ShutdownWatch {
    rx: watch::Receiver<ShutdownStatus>,
}

impl ShutdownWatch {
    pub fn state(&self) -> ShutdownState {
        self.rx.borrow().state
    }

    /// Wait for the next accepted transition and return it.
    ///
    /// Pends forever once every controller is gone.
    pub async fn changed(&mut self) -> ShutdownStatus {
        if self.rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        *self.rx.borrow_and_update()
    }

    /// Resolve once the state reaches at least `state`.
    pub async fn reached(&mut self, state: ShutdownState) {
        if self.rx.wait_for(|s| s.state >= state).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(term_child: bool, graceful_term: bool) -> ShutdownPolicy {
        ShutdownPolicy {
            term_child,
            graceful_term,
            term_timeout: Duration::from_millis(500),
        }
    }

    #[test]
    fn plan_matches_trigger_matrix() {
        let half = Duration::from_millis(500);

        assert_eq!(
            plan(&policy(false, false), ShutdownTrigger::Graceful),
            (ShutdownState::GracefulRequested, ShutdownAction::Cooperative)
        );
        assert_eq!(
            plan(&policy(false, false), ShutdownTrigger::Interrupt),
            (ShutdownState::Terminated, ShutdownAction::Kill)
        );
        assert_eq!(
            plan(&policy(false, true), ShutdownTrigger::Terminate),
            (ShutdownState::Terminated, ShutdownAction::Kill)
        );
        assert_eq!(
            plan(&policy(true, false), ShutdownTrigger::Interrupt),
            (ShutdownState::ForceRequested, ShutdownAction::Escalate { after: half })
        );
        assert_eq!(
            plan(&policy(true, true), ShutdownTrigger::Interrupt),
            (ShutdownState::ForceRequested, ShutdownAction::Escalate { after: half })
        );
        assert_eq!(
            plan(&policy(true, false), ShutdownTrigger::Terminate),
            (ShutdownState::ForceRequested, ShutdownAction::Escalate { after: half })
        );
        assert_eq!(
            plan(&policy(true, true), ShutdownTrigger::Terminate),
            (ShutdownState::GracefulRequested, ShutdownAction::Drain { grace: half })
        );
    }

    #[test]
    fn state_only_moves_forward() {
        let ctl = ShutdownController::new(policy(true, false));
        assert_eq!(ctl.state(), ShutdownState::Running);

        assert!(ctl.trigger(ShutdownTrigger::Interrupt));
        assert_eq!(ctl.state(), ShutdownState::ForceRequested);

        // A later graceful request cannot relax a forced shutdown.
        assert!(!ctl.request_graceful());
        assert_eq!(ctl.state(), ShutdownState::ForceRequested);

        assert!(ctl.advance_to(ShutdownState::Terminated));
        assert!(!ctl.advance_to(ShutdownState::ForceRequested));
        assert_eq!(ctl.state(), ShutdownState::Terminated);
    }

    #[test]
    fn repeated_trigger_is_ignored() {
        let ctl = ShutdownController::new(policy(false, false));
        assert!(ctl.request_graceful());
        assert!(!ctl.request_graceful());
        assert_eq!(ctl.status().action, Some(ShutdownAction::Cooperative));
    }

    #[test]
    fn graceful_then_interrupt_escalates() {
        let ctl = ShutdownController::new(policy(false, false));
        assert!(ctl.request_graceful());
        assert!(ctl.trigger(ShutdownTrigger::Interrupt));
        assert_eq!(
            ctl.status(),
            ShutdownStatus {
                state: ShutdownState::Terminated,
                action: Some(ShutdownAction::Kill),
            }
        );
    }

    #[tokio::test]
    async fn watchers_observe_transitions() {
        let ctl = ShutdownController::new(policy(true, true));
        let mut watch = ctl.subscribe();

        let ctl2 = ctl.clone();
        tokio::spawn(async move {
            ctl2.trigger(ShutdownTrigger::Terminate);
        });

        let status = watch.changed().await;
        assert_eq!(status.state, ShutdownState::GracefulRequested);
        assert!(matches!(status.action, Some(ShutdownAction::Drain { .. })));
        assert!(watch.state().stops_claiming());
    }
}
