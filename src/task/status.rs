//! Task state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::TaskLabel;

/// State of a tracked task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting in the queue backend (or waiting for redelivery).
    Queued,
    /// Owned by exactly one worker between dequeue and ack/nack.
    Running,
    /// Handler completed successfully.
    Succeeded,
    /// Handler failed; eligible for redelivery.
    Failed,
    /// Retries exhausted (or label unresolvable). Needs operator attention.
    DeadLettered,
}

impl TaskState {
    /// Check if this state allows transitioning to another state.
    ///
    /// Transitions are monotonic: once Succeeded or DeadLettered, a task
    /// never runs again. Running → Queued is the forced-requeue path used by
    /// shutdown reconciliation.
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::*;

        matches!(
            (self, target),
            (Queued, Running) | (Queued, DeadLettered) |
            (Running, Succeeded) | (Running, Failed) |
            (Running, DeadLettered) | (Running, Queued) |
            (Failed, Queued) | (Failed, DeadLettered)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::DeadLettered)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::DeadLettered => "dead_lettered",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "dead_lettered" => Ok(Self::DeadLettered),
            other => Err(format!("unknown task state: {other}")),
        }
    }
}

/// Durable per-task status record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: Uuid,
    pub label: TaskLabel,
    pub state: TaskState,
    /// Delivery ordinal of the most recent attempt.
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// Slot index of the worker that last ran the task.
    pub worker_id: Option<usize>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskStatus {
    /// Initial Queued record for a freshly submitted message.
    pub fn queued(task_id: Uuid, label: TaskLabel, submitted_at: DateTime<Utc>) -> Self {
        Self {
            task_id,
            label,
            state: TaskState::Queued,
            attempt_count: 0,
            last_error: None,
            worker_id: None,
            submitted_at,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Field updates applied together with a state transition.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub state: Option<TaskState>,
    pub attempt_count: Option<u32>,
    pub last_error: Option<String>,
    pub worker_id: Option<usize>,
}

impl StatusUpdate {
    pub fn to_state(state: TaskState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt_count = Some(attempt);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    pub fn with_worker(mut self, worker_id: usize) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    /// Apply to a status record, stamping timestamps for the new state.
    pub fn apply(&self, status: &mut TaskStatus) {
        if let Some(state) = self.state {
            status.state = state;
            match state {
                TaskState::Running => {
                    // Refreshed on every delivery so the stuck threshold
                    // measures the current attempt, not the first.
                    status.started_at = Some(Utc::now());
                }
                TaskState::Succeeded | TaskState::Failed | TaskState::DeadLettered => {
                    status.finished_at = Some(Utc::now());
                }
                TaskState::Queued => {
                    status.finished_at = None;
                }
            }
        }
        if let Some(attempt) = self.attempt_count {
            status.attempt_count = attempt;
        }
        if let Some(ref error) = self.last_error {
            status.last_error = Some(error.clone());
        }
        if let Some(worker_id) = self.worker_id {
            status.worker_id = Some(worker_id);
        }
    }
}
