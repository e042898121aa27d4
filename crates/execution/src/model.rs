//! Execution records, checkpoints, outbox entries and the status state machine.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use molflow_core::{CheckpointId, DomainError, ExecutionId, ExpectedVersion, OutboxEntryId};

/// Execution status.
///
/// ```text
/// PENDING ──► RUNNING ──► SUCCEEDED
///               │  ▲
///               │  ├──── WAITING_RETRY ──► BROKEN
///               │  └──── WAITING_RESUME
///               ├──► FAILED
///               └──► BROKEN
/// any non-terminal ──► CANCELLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Created, not yet claimed by a worker
    Pending,
    /// Claimed by exactly one worker
    Running,
    /// Work completed and result persisted
    Succeeded,
    /// Non-retryable error
    Failed,
    /// Cancelled on request
    Cancelled,
    /// Transient failure, waiting for the scheduler to re-dispatch
    WaitingRetry,
    /// Checkpointed and suspended until resumed
    WaitingResume,
    /// Retry budget exhausted; needs an operator
    Broken,
}

impl ExecutionStatus {
    pub const ALL: [ExecutionStatus; 8] = [
        ExecutionStatus::Pending,
        ExecutionStatus::Running,
        ExecutionStatus::Succeeded,
        ExecutionStatus::Failed,
        ExecutionStatus::Cancelled,
        ExecutionStatus::WaitingRetry,
        ExecutionStatus::WaitingResume,
        ExecutionStatus::Broken,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Succeeded => "SUCCEEDED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Cancelled => "CANCELLED",
            ExecutionStatus::WaitingRetry => "WAITING_RETRY",
            ExecutionStatus::WaitingResume => "WAITING_RESUME",
            ExecutionStatus::Broken => "BROKEN",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::Broken
        )
    }

    /// Statuses a worker may claim into `RUNNING`.
    pub fn is_runnable(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Pending | ExecutionStatus::WaitingRetry | ExecutionStatus::WaitingResume
        )
    }

    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;

        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Cancelled) => true,
            (Pending | WaitingRetry | WaitingResume, Running) => true,
            (Running, Succeeded | WaitingRetry | WaitingResume | Failed | Broken) => true,
            (WaitingRetry, Broken) => true,
            _ => false,
        }
    }

    /// Every status from which `next` is reachable in one step.
    pub fn sources_of(next: ExecutionStatus) -> Vec<ExecutionStatus> {
        Self::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown execution status: {s}")))
    }
}

/// The unit of durable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: ExecutionId,
    pub idempotency_key: String,
    pub provider_name: String,
    pub status: ExecutionStatus,
    /// Input document, mutated in place as results accumulate.
    pub payload: JsonValue,
    /// Last fatal or transient error description.
    pub error: Option<String>,
    /// Incremented by every accepted write.
    pub version: u64,
    /// Number of times the execution was claimed into `RUNNING`.
    pub attempts: u32,
    /// Earliest re-dispatch time while `WAITING_RETRY`.
    pub retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    /// A fresh `PENDING` execution at version 1.
    pub fn new(
        provider_name: impl Into<String>,
        idempotency_key: impl Into<String>,
        payload: JsonValue,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_id: ExecutionId::new(),
            idempotency_key: idempotency_key.into(),
            provider_name: provider_name.into(),
            status: ExecutionStatus::Pending,
            payload,
            error: None,
            version: 1,
            attempts: 0,
            retry_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn expected_version(&self) -> ExpectedVersion {
        ExpectedVersion::exact(self.version)
    }

    pub fn meta(&self) -> ExecutionMeta {
        ExecutionMeta {
            execution_id: self.execution_id,
            provider_name: self.provider_name.clone(),
            status: self.status,
            error: self.error.clone(),
            attempts: self.attempts,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Snapshot returned to callers by `start` and `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMeta {
    pub execution_id: ExecutionId,
    pub provider_name: String,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Named progress marker owned by one execution. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub execution_id: ExecutionId,
    pub step: String,
    pub data: JsonValue,
    /// Execution version observed while the checkpoint was recorded.
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

/// A checkpoint waiting to be written with the next commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCheckpoint {
    pub step: String,
    pub data: JsonValue,
}

/// Durable record of a domain event awaiting delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: OutboxEntryId,
    pub execution_id: ExecutionId,
    pub event_type: String,
    pub payload: JsonValue,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOutboxEntry {
    pub event_type: String,
    pub payload: JsonValue,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExecutionStatus::*;

    #[test]
    fn terminal_states_accept_nothing() {
        for terminal in [Succeeded, Failed, Cancelled, Broken] {
            assert!(terminal.is_terminal());
            for next in ExecutionStatus::ALL {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn documented_edges_are_allowed() {
        let edges = [
            (Pending, Running),
            (Running, Succeeded),
            (Running, WaitingRetry),
            (WaitingRetry, Running),
            (Running, WaitingResume),
            (WaitingResume, Running),
            (Running, Failed),
            (Running, Broken),
            (WaitingRetry, Broken),
        ];
        for (from, to) in edges {
            assert!(from.can_transition_to(to), "{from} -> {to}");
        }
        for from in [Pending, Running, WaitingRetry, WaitingResume] {
            assert!(from.can_transition_to(Cancelled));
        }
    }

    #[test]
    fn undocumented_edges_are_rejected() {
        assert!(!Pending.can_transition_to(Succeeded));
        assert!(!Pending.can_transition_to(WaitingRetry));
        assert!(!WaitingResume.can_transition_to(Broken));
        assert!(!Running.can_transition_to(Running));
        assert!(!Running.can_transition_to(Pending));
    }

    #[test]
    fn sources_of_running_are_the_runnable_states() {
        let mut sources = ExecutionStatus::sources_of(Running);
        sources.sort_by_key(|s| s.as_str());
        assert_eq!(sources, vec![Pending, WaitingResume, WaitingRetry]);
        assert!(sources.iter().all(|s| s.is_runnable()));
    }

    #[test]
    fn status_codes_round_trip() {
        for status in ExecutionStatus::ALL {
            assert_eq!(status.as_str().parse::<ExecutionStatus>().unwrap(), status);
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                JsonValue::String(status.as_str().to_string())
            );
        }
        assert!("DONE".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn new_execution_starts_pending_at_version_one() {
        let execution = Execution::new("p", "k", serde_json::json!({}));
        assert_eq!(execution.status, Pending);
        assert_eq!(execution.version, 1);
        assert_eq!(execution.attempts, 0);
        assert_eq!(execution.meta().status, Pending);
    }
}
