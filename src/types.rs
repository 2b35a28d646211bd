use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identity of one executor unit (one fork cycle).
///
/// `supervisor` is the OS pid of the supervising process, `seq` the fork
/// counter within that supervisor's run. Rendered as `"<supervisor>-<seq>"`,
/// which is also how it appears in spool claim file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ExecutorId {
    pub supervisor: u32,
    pub seq: u64,
}

impl ExecutorId {
    pub fn new(supervisor: u32, seq: u64) -> Self {
        Self { supervisor, seq }
    }
}

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.supervisor, self.seq)
    }
}

impl FromStr for ExecutorId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (sup, seq) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| format!("invalid executor id '{s}' (expected <pid>-<seq>)"))?;
        let supervisor = sup
            .parse()
            .map_err(|e| format!("invalid supervisor pid in executor id '{s}': {e}"))?;
        let seq = seq
            .parse()
            .map_err(|e| format!("invalid sequence in executor id '{s}': {e}"))?;
        Ok(Self { supervisor, seq })
    }
}

impl From<ExecutorId> for String {
    fn from(id: ExecutorId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for ExecutorId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Opaque job identifier assigned at enqueue time.
pub type JobId = String;

/// Why an executor unit ended its fork cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum ExitReason {
    /// `jobs_per_fork` reached.
    JobLimit,
    /// `seconds_per_fork` elapsed.
    TimeLimit,
    /// Nothing claimable and the poll interval is zero.
    QueueDrained,
    /// Left cooperatively after a shutdown or drain request.
    Shutdown,
    /// Interrupted by the termination signal.
    Terminated,
    /// Killed outright; no hook ran.
    Killed,
    /// Died without an exit report.
    Crashed(String),
}

impl ExitReason {
    /// Normal rotation: the fork used up its budget or ran out of work.
    pub fn is_rotation(&self) -> bool {
        matches!(
            self,
            ExitReason::JobLimit | ExitReason::TimeLimit | ExitReason::QueueDrained
        )
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            ExitReason::JobLimit => "job_limit",
            ExitReason::TimeLimit => "time_limit",
            ExitReason::QueueDrained => "queue_drained",
            ExitReason::Shutdown => "shutdown",
            ExitReason::Terminated => "terminated",
            ExitReason::Killed => "killed",
            ExitReason::Crashed(_) => "crashed",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Crashed(detail) => write!(f, "crashed ({detail})"),
            other => f.write_str(other.as_label()),
        }
    }
}

/// Final report of one fork cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitReport {
    pub executor: ExecutorId,
    pub processed: u64,
    pub reason: ExitReason,
}
