//! In-memory state store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StateStoreError;
use crate::store::traits::{StateStore, SubmitOutcome, TaskRecord};
use crate::task::{ScheduleMessage, StatusUpdate, TaskState, TaskStatus};

#[derive(Default)]
struct Inner {
    records: HashMap<Uuid, TaskRecord>,
    /// Active dedup keys → owning task. Entries drop on terminal transition.
    dedup: HashMap<String, Uuid>,
}

/// Non-durable state store for tests and single-process deployments.
pub struct InMemoryStateStore {
    inner: Mutex<Inner>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn submit(&self, message: &ScheduleMessage) -> Result<SubmitOutcome, StateStoreError> {
        let mut inner = self.inner.lock().await;

        if let Some(key) = &message.dedup_key {
            if let Some(&existing) = inner.dedup.get(key) {
                let still_active = inner
                    .records
                    .get(&existing)
                    .is_some_and(|r| !r.status.state.is_terminal());
                if still_active {
                    return Ok(SubmitOutcome::Duplicate {
                        existing_task_id: existing,
                    });
                }
                inner.dedup.remove(key);
            }
            inner.dedup.insert(key.clone(), message.task_id);
        }

        let status = TaskStatus::queued(message.task_id, message.label, message.submitted_at);
        inner.records.insert(
            message.task_id,
            TaskRecord {
                message: message.clone(),
                status,
            },
        );
        Ok(SubmitOutcome::Created)
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<TaskRecord>, StateStoreError> {
        Ok(self.inner.lock().await.records.get(&task_id).cloned())
    }

    async fn try_transition(
        &self,
        task_id: Uuid,
        expected: &[TaskState],
        update: StatusUpdate,
    ) -> Result<TaskStatus, StateStoreError> {
        let target = update
            .state
            .ok_or_else(|| StateStoreError::Backend("transition without target state".into()))?;

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let record = inner
            .records
            .get_mut(&task_id)
            .ok_or(StateStoreError::NotFound { task_id })?;

        let current = record.status.state;
        if !expected.contains(&current) || !current.can_transition_to(target) {
            return Err(StateStoreError::CasConflict {
                task_id,
                actual: current,
                requested: target,
            });
        }

        update.apply(&mut record.status);
        let status = record.status.clone();
        let dedup_key = record.message.dedup_key.clone();
        if target.is_terminal()
            && let Some(key) = dedup_key
            && inner.dedup.get(&key) == Some(&task_id)
        {
            inner.dedup.remove(&key);
        }
        Ok(status)
    }

    async fn non_terminal(&self) -> Result<Vec<TaskRecord>, StateStoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .records
            .values()
            .filter(|r| !r.status.state.is_terminal())
            .cloned()
            .collect())
    }

    async fn running(&self) -> Result<Vec<TaskStatus>, StateStoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .records
            .values()
            .filter(|r| r.status.state == TaskState::Running)
            .map(|r| r.status.clone())
            .collect())
    }

    async fn purge_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StateStoreError> {
        let mut inner = self.inner.lock().await;
        let doomed: Vec<Uuid> = inner
            .records
            .values()
            .filter(|r| {
                r.status.state.is_terminal()
                    && r.status.finished_at.is_some_and(|at| at < cutoff)
            })
            .map(|r| r.status.task_id)
            .collect();
        for id in &doomed {
            inner.records.remove(id);
        }
        Ok(doomed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskPayload;

    fn msg() -> ScheduleMessage {
        ScheduleMessage::new(
            "u1",
            "cube-1",
            TaskPayload::Add {
                messages: vec!["x".into()],
            },
        )
    }

    #[tokio::test]
    async fn submit_creates_queued_record() {
        let store = InMemoryStateStore::new();
        let m = msg();
        assert_eq!(store.submit(&m).await.unwrap(), SubmitOutcome::Created);

        let record = store.get(m.task_id).await.unwrap().unwrap();
        assert_eq!(record.status.state, TaskState::Queued);
        assert_eq!(record.status.attempt_count, 0);
    }

    #[tokio::test]
    async fn dedup_collapses_to_existing_task() {
        let store = InMemoryStateStore::new();
        let first = msg().with_dedup_key("k1");
        let second = msg().with_dedup_key("k1");
        store.submit(&first).await.unwrap();

        let outcome = store.submit(&second).await.unwrap();
        assert_eq!(
            outcome,
            SubmitOutcome::Duplicate {
                existing_task_id: first.task_id
            }
        );
        assert!(store.get(second.task_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dedup_key_released_on_terminal() {
        let store = InMemoryStateStore::new();
        let first = msg().with_dedup_key("k1");
        store.submit(&first).await.unwrap();
        store
            .try_transition(
                first.task_id,
                &[TaskState::Queued],
                StatusUpdate::to_state(TaskState::Running),
            )
            .await
            .unwrap();
        store
            .try_transition(
                first.task_id,
                &[TaskState::Running],
                StatusUpdate::to_state(TaskState::Succeeded),
            )
            .await
            .unwrap();

        let second = msg().with_dedup_key("k1");
        assert_eq!(store.submit(&second).await.unwrap(), SubmitOutcome::Created);
    }

    #[tokio::test]
    async fn cas_rejects_unexpected_state() {
        let store = InMemoryStateStore::new();
        let m = msg();
        store.submit(&m).await.unwrap();

        let err = store
            .try_transition(
                m.task_id,
                &[TaskState::Running],
                StatusUpdate::to_state(TaskState::Succeeded),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StateStoreError::CasConflict {
                actual: TaskState::Queued,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn cas_rejects_illegal_transition() {
        let store = InMemoryStateStore::new();
        let m = msg();
        store.submit(&m).await.unwrap();

        // Queued is in `expected`, but Queued → Succeeded is not legal.
        let err = store
            .try_transition(
                m.task_id,
                &[TaskState::Queued],
                StatusUpdate::to_state(TaskState::Succeeded),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StateStoreError::CasConflict { .. }));
    }

    #[tokio::test]
    async fn stale_redelivery_cannot_overwrite_terminal() {
        let store = InMemoryStateStore::new();
        let m = msg();
        store.submit(&m).await.unwrap();
        store
            .try_transition(
                m.task_id,
                &[TaskState::Queued],
                StatusUpdate::to_state(TaskState::Running),
            )
            .await
            .unwrap();
        store
            .try_transition(
                m.task_id,
                &[TaskState::Running],
                StatusUpdate::to_state(TaskState::Succeeded),
            )
            .await
            .unwrap();

        let err = store
            .try_transition(
                m.task_id,
                &[TaskState::Queued, TaskState::Failed],
                StatusUpdate::to_state(TaskState::Running),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StateStoreError::CasConflict {
                actual: TaskState::Succeeded,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn purge_removes_old_terminal_records() {
        let store = InMemoryStateStore::new();
        let m = msg();
        store.submit(&m).await.unwrap();
        store
            .try_transition(
                m.task_id,
                &[TaskState::Queued],
                StatusUpdate::to_state(TaskState::Running),
            )
            .await
            .unwrap();
        store
            .try_transition(
                m.task_id,
                &[TaskState::Running],
                StatusUpdate::to_state(TaskState::Succeeded),
            )
            .await
            .unwrap();

        // Nothing is old enough yet.
        let purged = store
            .purge_terminal_before(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(purged, 0);

        let purged = store
            .purge_terminal_before(Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.get(m.task_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn running_lists_only_running() {
        let store = InMemoryStateStore::new();
        let a = msg();
        let b = msg();
        store.submit(&a).await.unwrap();
        store.submit(&b).await.unwrap();
        store
            .try_transition(
                a.task_id,
                &[TaskState::Queued],
                StatusUpdate::to_state(TaskState::Running).with_worker(0),
            )
            .await
            .unwrap();

        let running = store.running().await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].task_id, a.task_id);
        assert_eq!(store.non_terminal().await.unwrap().len(), 2);
    }
}
