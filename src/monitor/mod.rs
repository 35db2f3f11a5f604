//! Scheduler observability: counters, worker heartbeats, stuck-task sweep.

pub mod health;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

pub use health::{HealthSnapshot, health_routes};

use crate::store::StateStore;
use crate::task::{StatusUpdate, TaskLabel, TaskState};

/// A task currently owned by a worker.
#[derive(Debug, Clone)]
pub struct RunningTask {
    pub worker_id: usize,
    pub label: TaskLabel,
    pub started_at: Instant,
}

/// Counter snapshot for health output.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CountersSnapshot {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

/// Tracks worker health and task throughput.
pub struct Monitor {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    degraded: AtomicBool,
    running: RwLock<HashMap<Uuid, RunningTask>>,
    heartbeats: RwLock<HashMap<usize, Instant>>,
}

impl Monitor {
    pub fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
            running: RwLock::new(HashMap::new()),
            heartbeats: RwLock::new(HashMap::new()),
        }
    }

    // ── Task lifecycle hooks ────────────────────────────────────────

    pub fn task_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn task_started(&self, task_id: Uuid, worker_id: usize, label: TaskLabel) {
        self.running.write().await.insert(
            task_id,
            RunningTask {
                worker_id,
                label,
                started_at: Instant::now(),
            },
        );
    }

    pub async fn task_finished(&self, task_id: Uuid) {
        self.running.write().await.remove(&task_id);
    }

    pub fn task_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    // ── Worker health ───────────────────────────────────────────────

    pub async fn heartbeat(&self, worker_id: usize) {
        self.heartbeats.write().await.insert(worker_id, Instant::now());
    }

    /// Workers whose last heartbeat is older than `stale_after`.
    pub async fn stale_workers(&self, stale_after: Duration) -> Vec<usize> {
        let now = Instant::now();
        self.heartbeats
            .read()
            .await
            .iter()
            .filter(|(_, at)| now.duration_since(**at) > stale_after)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Degraded flag, set by the queue adapter while the backend is down.
    pub fn set_degraded(&self, degraded: bool) {
        let was = self.degraded.swap(degraded, Ordering::AcqRel);
        if degraded && !was {
            tracing::warn!("Queue backend degraded");
        } else if !degraded && was {
            tracing::info!("Queue backend recovered");
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub async fn running_count(&self) -> usize {
        self.running.read().await.len()
    }

    pub fn counters(&self) -> CountersSnapshot {
        CountersSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }

    // ── Stuck-task detection ────────────────────────────────────────

    /// One sweep: force-fail every task Running longer than `threshold`.
    ///
    /// The worker owning such a task is presumed wedged; its delivery is
    /// never acked, so the backend redelivers after the visibility timeout
    /// and a different worker picks the task up.
    pub async fn sweep_stuck(
        &self,
        store: &Arc<dyn StateStore>,
        threshold: Duration,
    ) -> Vec<Uuid> {
        let now = Instant::now();
        let overdue: Vec<(Uuid, RunningTask)> = self
            .running
            .read()
            .await
            .iter()
            .filter(|(_, t)| now.duration_since(t.started_at) > threshold)
            .map(|(id, t)| (*id, t.clone()))
            .collect();

        let mut released = Vec::new();
        for (task_id, task) in overdue {
            let update = StatusUpdate::to_state(TaskState::Failed).with_error(format!(
                "stuck: running longer than {threshold:?} on worker {}",
                task.worker_id
            ));
            match store.try_transition(task_id, &[TaskState::Running], update).await {
                Ok(_) => {
                    tracing::error!(
                        task_id = %task_id,
                        label = %task.label,
                        worker_id = task.worker_id,
                        "Stuck task force-failed, released for redelivery"
                    );
                    self.task_failed();
                    released.push(task_id);
                }
                Err(e) => {
                    tracing::debug!(task_id = %task_id, error = %e, "Stuck sweep lost race");
                }
            }
            self.running.write().await.remove(&task_id);
        }
        released
    }

    /// Periodic stuck sweep until the shutdown signal flips.
    pub fn spawn_stuck_detector(
        self: &Arc<Self>,
        store: Arc<dyn StateStore>,
        threshold: Duration,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {
                        monitor.sweep_stuck(&store, threshold).await;
                    }
                }
            }
        })
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}
