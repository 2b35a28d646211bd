// src/executor/protocol.rs

//! JSON-lines control protocol between the supervisor and an executor
//! process.
//!
//! The supervisor writes [`ControlMessage`]s to the executor's stdin; the
//! executor writes [`ExecutorEvent`]s to its stdout, one JSON object per
//! line. Task-backed executors emit the same events over a channel.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{JobError, MultiforkError, Result};
use crate::policy::ForkPolicy;
use crate::shutdown::ShutdownState;
use crate::types::{ExecutorId, ExitReason, JobId};

/// Supervisor → executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// First line on stdin; everything the executor needs to run.
    Start {
        executor: ExecutorId,
        fork: ForkPolicy,
        shutdown: ShutdownState,
        poll_interval_ms: u64,
    },
    /// Mirror of the supervisor's shutdown state.
    Shutdown { state: ShutdownState },
    /// Stop claiming; abandon the in-flight job after `grace_ms`.
    Drain { grace_ms: u64 },
}

/// How a job left the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed,
    Failed { error: JobError },
    /// Dropped at a drain deadline; the claim is left for orphan recovery.
    Abandoned,
}

/// Executor → supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutorEvent {
    /// `after_fork` has run.
    Ready,
    JobStarted { job: JobId },
    JobFinished {
        job: JobId,
        outcome: JobOutcome,
        /// Jobs counted against this fork so far.
        processed: u64,
    },
    /// Last event; `before_child_exit` has run.
    Exiting { processed: u64, reason: ExitReason },
}

pub fn encode_line<T: Serialize>(msg: &T) -> Result<String> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T> {
    serde_json::from_str(line.trim())
        .map_err(|e| MultiforkError::Protocol(format!("bad message '{}': {e}", line.trim())))
}

pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_message_wire_format() {
        let msg = ControlMessage::Start {
            executor: ExecutorId::new(10, 2),
            fork: ForkPolicy::default(),
            shutdown: ShutdownState::Running,
            poll_interval_ms: 0,
        };
        let line = encode_line(&msg).unwrap();
        assert!(line.ends_with('\n'));
        assert!(line.contains(r#""type":"start""#));
        assert!(line.contains(r#""executor":"10-2""#));
        assert_eq!(decode_line::<ControlMessage>(&line).unwrap(), msg);
    }

    #[test]
    fn exiting_event_carries_reason() {
        let line = r#"{"type":"exiting","processed":3,"reason":{"reason":"time_limit"}}"#;
        let event: ExecutorEvent = decode_line(line).unwrap();
        assert_eq!(
            event,
            ExecutorEvent::Exiting {
                processed: 3,
                reason: ExitReason::TimeLimit
            }
        );
    }

    #[test]
    fn garbage_is_a_protocol_error() {
        let err = decode_line::<ExecutorEvent>("hello").unwrap_err();
        assert!(matches!(err, MultiforkError::Protocol(_)));
    }
}
