//! State store trait — durable task records keyed by `task_id`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StateStoreError;
use crate::task::{ScheduleMessage, StatusUpdate, TaskState, TaskStatus};

/// Persisted message plus its status record.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub message: ScheduleMessage,
    pub status: TaskStatus,
}

/// Outcome of a submission insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Created,
    /// A non-terminal task already holds this `dedup_key`; no new record was
    /// created.
    Duplicate { existing_task_id: Uuid },
}

/// Durable task state, used for crash recovery, status queries, and
/// `dedup_key` enforcement.
///
/// Row updates are local to a `task_id`; `try_transition` is the
/// compare-and-set that keeps a stale, concurrently-arriving redelivery from
/// overwriting a newer state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert a Queued record for a freshly submitted message, enforcing
    /// `dedup_key` uniqueness among non-terminal tasks.
    async fn submit(&self, message: &ScheduleMessage) -> Result<SubmitOutcome, StateStoreError>;

    /// Fetch one record.
    async fn get(&self, task_id: Uuid) -> Result<Option<TaskRecord>, StateStoreError>;

    /// Compare-and-set transition: applies `update` only when the current
    /// state is in `expected` AND may legally transition to the target.
    /// Returns the updated status, or `CasConflict` with the actual state.
    async fn try_transition(
        &self,
        task_id: Uuid,
        expected: &[TaskState],
        update: StatusUpdate,
    ) -> Result<TaskStatus, StateStoreError>;

    /// All records not yet in a terminal state.
    async fn non_terminal(&self) -> Result<Vec<TaskRecord>, StateStoreError>;

    /// Status of every task currently recorded as Running.
    async fn running(&self) -> Result<Vec<TaskStatus>, StateStoreError>;

    /// Delete terminal records finished before `cutoff`. Returns the count.
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StateStoreError>;
}
