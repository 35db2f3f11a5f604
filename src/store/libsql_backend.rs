//! libSQL state store — durable `StateStore` implementation.
//!
//! Supports local file and in-memory databases. Dedup enforcement rides on a
//! partial unique index over active states, and the compare-and-set
//! transition is a single conditional UPDATE, so concurrent workers cannot
//! interleave between check and write.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Value, params};
use tracing::info;
use uuid::Uuid;

use crate::error::StateStoreError;
use crate::store::migrations;
use crate::store::traits::{StateStore, SubmitOutcome, TaskRecord};
use crate::task::{ScheduleMessage, StatusUpdate, TaskState, TaskStatus};

const RECORD_COLUMNS: &str = "task_id, state, message, attempt_count, last_error, worker_id, \
                              submitted_at, started_at, finished_at";

/// libSQL-backed state store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStateStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStateStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StateStoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StateStoreError::Backend(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StateStoreError::Backend(format!("Failed to open database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StateStoreError::Backend(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        info!(path = %path.display(), "Task state database opened");
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StateStoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StateStoreError::Backend(format!("Failed to create database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StateStoreError::Backend(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    async fn find_active_by_dedup_key(
        &self,
        key: &str,
    ) -> Result<Option<Uuid>, StateStoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT task_id FROM tasks
                 WHERE dedup_key = ?1 AND state IN ('queued', 'running', 'failed')
                 LIMIT 1",
                params![key],
            )
            .await
            .map_err(|e| StateStoreError::Backend(format!("Dedup lookup failed: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| StateStoreError::Backend(format!("Dedup lookup failed: {e}")))?
        {
            Some(row) => {
                let id: String = row
                    .get(0)
                    .map_err(|e| StateStoreError::Backend(e.to_string()))?;
                Ok(Some(parse_uuid(&id)?))
            }
            None => Ok(None),
        }
    }

    async fn fetch_record(&self, task_id: Uuid) -> Result<Option<TaskRecord>, StateStoreError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {RECORD_COLUMNS} FROM tasks WHERE task_id = ?1"),
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| StateStoreError::Backend(format!("Fetch failed: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| StateStoreError::Backend(format!("Fetch failed: {e}")))?
        {
            Some(row) => Ok(Some(row_to_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn fetch_records_where(&self, predicate: &str) -> Result<Vec<TaskRecord>, StateStoreError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {RECORD_COLUMNS} FROM tasks WHERE {predicate}"),
                (),
            )
            .await
            .map_err(|e| StateStoreError::Backend(format!("Query failed: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StateStoreError::Backend(format!("Query failed: {e}")))?
        {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }
}

// ── Row mapping helpers ─────────────────────────────────────────────

fn parse_uuid(s: &str) -> Result<Uuid, StateStoreError> {
    Uuid::parse_str(s).map_err(|e| StateStoreError::Backend(format!("Bad task_id {s}: {e}")))
}

/// Parse an RFC 3339 datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Map a libsql row (RECORD_COLUMNS order) to a TaskRecord.
fn row_to_record(row: &libsql::Row) -> Result<TaskRecord, StateStoreError> {
    let task_id_str: String = row.get(0).map_err(|e| StateStoreError::Backend(e.to_string()))?;
    let state_str: String = row.get(1).map_err(|e| StateStoreError::Backend(e.to_string()))?;
    let message_json: String = row.get(2).map_err(|e| StateStoreError::Backend(e.to_string()))?;
    let attempt_count: i64 = row.get(3).map_err(|e| StateStoreError::Backend(e.to_string()))?;
    let last_error: Option<String> = row.get(4).ok();
    let worker_id: Option<i64> = row.get(5).ok();
    let submitted_str: String = row.get(6).map_err(|e| StateStoreError::Backend(e.to_string()))?;
    let started_str: Option<String> = row.get(7).ok();
    let finished_str: Option<String> = row.get(8).ok();

    let message: ScheduleMessage = serde_json::from_str(&message_json)
        .map_err(|e| StateStoreError::Serialization(e.to_string()))?;
    let state: TaskState = state_str
        .parse()
        .map_err(|e: String| StateStoreError::Backend(e))?;

    let status = TaskStatus {
        task_id: parse_uuid(&task_id_str)?,
        label: message.label,
        state,
        attempt_count: attempt_count.max(0) as u32,
        last_error,
        worker_id: worker_id.map(|w| w.max(0) as usize),
        submitted_at: parse_datetime(&submitted_str),
        started_at: started_str.as_deref().map(parse_datetime),
        finished_at: finished_str.as_deref().map(parse_datetime),
    };
    Ok(TaskRecord { message, status })
}

fn in_clause(states: &[TaskState]) -> String {
    states
        .iter()
        .map(|s| format!("'{s}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl StateStore for LibSqlStateStore {
    async fn submit(&self, message: &ScheduleMessage) -> Result<SubmitOutcome, StateStoreError> {
        if let Some(key) = &message.dedup_key {
            if let Some(existing) = self.find_active_by_dedup_key(key).await? {
                return Ok(SubmitOutcome::Duplicate {
                    existing_task_id: existing,
                });
            }
        }

        let message_json = serde_json::to_string(message)
            .map_err(|e| StateStoreError::Serialization(e.to_string()))?;
        let dedup_value = match &message.dedup_key {
            Some(key) => Value::from(key.clone()),
            None => Value::Null,
        };

        let result = self
            .conn
            .execute(
                "INSERT INTO tasks (task_id, label, state, message, dedup_key, submitted_at)
                 VALUES (?1, ?2, 'queued', ?3, ?4, ?5)",
                params![
                    message.task_id.to_string(),
                    message.label.as_str(),
                    message_json,
                    dedup_value,
                    message.submitted_at.to_rfc3339(),
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(SubmitOutcome::Created),
            Err(e) if e.to_string().contains("UNIQUE") && message.dedup_key.is_some() => {
                // Lost the race on the partial index; surface the winner.
                let key = message.dedup_key.as_deref().unwrap_or_default();
                match self.find_active_by_dedup_key(key).await? {
                    Some(existing) => Ok(SubmitOutcome::Duplicate {
                        existing_task_id: existing,
                    }),
                    None => Err(StateStoreError::Backend(format!("Insert failed: {e}"))),
                }
            }
            Err(e) => Err(StateStoreError::Backend(format!("Insert failed: {e}"))),
        }
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<TaskRecord>, StateStoreError> {
        self.fetch_record(task_id).await
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

        // Only froms that may legally reach the target participate in the CAS.
        let allowed: Vec<TaskState> = expected
            .iter()
            .copied()
            .filter(|s| s.can_transition_to(target))
            .collect();

        let updated = if allowed.is_empty() {
            0
        } else {
            let now = Utc::now().to_rfc3339();
            let timestamp_clause = match target {
                TaskState::Running => ", started_at = ?5",
                TaskState::Succeeded | TaskState::Failed | TaskState::DeadLettered => {
                    ", finished_at = ?5"
                }
                TaskState::Queued => ", finished_at = NULL",
            };
            let sql = format!(
                "UPDATE tasks SET state = ?1,
                        attempt_count = COALESCE(?2, attempt_count),
                        last_error = COALESCE(?3, last_error),
                        worker_id = COALESCE(?4, worker_id)
                        {timestamp_clause}
                 WHERE task_id = ?6 AND state IN ({})",
                in_clause(&allowed)
            );
            let attempt_value = match update.attempt_count {
                Some(attempt) => Value::from(attempt as i64),
                None => Value::Null,
            };
            let error_value = match update.last_error.clone() {
                Some(error) => Value::from(error),
                None => Value::Null,
            };
            let worker_value = match update.worker_id {
                Some(worker) => Value::from(worker as i64),
                None => Value::Null,
            };
            self.conn
                .execute(
                    &sql,
                    params![
                        target.to_string(),
                        attempt_value,
                        error_value,
                        worker_value,
                        now,
                        task_id.to_string(),
                    ],
                )
                .await
                .map_err(|e| StateStoreError::Backend(format!("CAS update failed: {e}")))?
        };

        if updated == 0 {
            return match self.fetch_record(task_id).await? {
                Some(record) => Err(StateStoreError::CasConflict {
                    task_id,
                    actual: record.status.state,
                    requested: target,
                }),
                None => Err(StateStoreError::NotFound { task_id }),
            };
        }

        self.fetch_record(task_id)
            .await?
            .map(|r| r.status)
            .ok_or(StateStoreError::NotFound { task_id })
    }

    async fn non_terminal(&self) -> Result<Vec<TaskRecord>, StateStoreError> {
        self.fetch_records_where("state IN ('queued', 'running', 'failed')")
            .await
    }

    async fn running(&self) -> Result<Vec<TaskStatus>, StateStoreError> {
        Ok(self
            .fetch_records_where("state = 'running'")
            .await?
            .into_iter()
            .map(|r| r.status)
            .collect())
    }

    async fn purge_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StateStoreError> {
        let purged = self
            .conn
            .execute(
                "DELETE FROM tasks
                 WHERE state IN ('succeeded', 'dead_lettered')
                   AND finished_at IS NOT NULL
                   AND finished_at < ?1",
                params![cutoff.to_rfc3339()],
            )
            .await
            .map_err(|e| StateStoreError::Backend(format!("Purge failed: {e}")))?;
        Ok(purged as usize)
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
    async fn submit_and_get_roundtrip() {
        let store = LibSqlStateStore::new_memory().await.unwrap();
        let m = msg();
        assert_eq!(store.submit(&m).await.unwrap(), SubmitOutcome::Created);

        let record = store.get(m.task_id).await.unwrap().unwrap();
        assert_eq!(record.status.state, TaskState::Queued);
        assert_eq!(record.message.task_id, m.task_id);
        assert_eq!(record.message.user_id, "u1");
    }

    #[tokio::test]
    async fn dedup_returns_existing_id() {
        let store = LibSqlStateStore::new_memory().await.unwrap();
        let first = msg().with_dedup_key("k1");
        let second = msg().with_dedup_key("k1");
        store.submit(&first).await.unwrap();

        assert_eq!(
            store.submit(&second).await.unwrap(),
            SubmitOutcome::Duplicate {
                existing_task_id: first.task_id
            }
        );
    }

    #[tokio::test]
    async fn dedup_key_frees_after_terminal() {
        let store = LibSqlStateStore::new_memory().await.unwrap();
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
    async fn cas_is_single_winner() {
        let store = LibSqlStateStore::new_memory().await.unwrap();
        let m = msg();
        store.submit(&m).await.unwrap();

        let first = store
            .try_transition(
                m.task_id,
                &[TaskState::Queued, TaskState::Failed],
                StatusUpdate::to_state(TaskState::Running).with_worker(0).with_attempt(1),
            )
            .await;
        assert!(first.is_ok());

        let second = store
            .try_transition(
                m.task_id,
                &[TaskState::Queued, TaskState::Failed],
                StatusUpdate::to_state(TaskState::Running).with_worker(1).with_attempt(1),
            )
            .await;
        assert!(matches!(
            second,
            Err(StateStoreError::CasConflict {
                actual: TaskState::Running,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn terminal_state_is_immutable() {
        let store = LibSqlStateStore::new_memory().await.unwrap();
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
                StatusUpdate::to_state(TaskState::DeadLettered).with_error("exhausted"),
            )
            .await
            .unwrap();

        let err = store
            .try_transition(
                m.task_id,
                &[TaskState::DeadLettered],
                StatusUpdate::to_state(TaskState::Running),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StateStoreError::CasConflict { .. }));

        let record = store.get(m.task_id).await.unwrap().unwrap();
        assert_eq!(record.status.last_error.as_deref(), Some("exhausted"));
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let store = LibSqlStateStore::new_memory().await.unwrap();
        let err = store
            .try_transition(
                Uuid::new_v4(),
                &[TaskState::Queued],
                StatusUpdate::to_state(TaskState::Running),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StateStoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn purge_respects_cutoff() {
        let store = LibSqlStateStore::new_memory().await.unwrap();
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
    async fn survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        let m = msg();

        {
            let store = LibSqlStateStore::new_local(&path).await.unwrap();
            store.submit(&m).await.unwrap();
            store
                .try_transition(
                    m.task_id,
                    &[TaskState::Queued],
                    StatusUpdate::to_state(TaskState::Running).with_worker(3),
                )
                .await
                .unwrap();
        }

        let store = LibSqlStateStore::new_local(&path).await.unwrap();
        let running = store.running().await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].task_id, m.task_id);
        assert_eq!(running[0].worker_id, Some(3));
    }
}
