//! Lifecycle controller — starts and stops the worker pool, drains in-flight
//! work, and reconciles recorded state across the stop/start boundary.

use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::error::ControllerError;
use crate::task::{StatusUpdate, TaskState};
use crate::worker::pool::{PoolHandle, WorkerDeps, WorkerPool};

/// Lifecycle state of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ControllerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Default)]
struct ControllerInner {
    pool: Option<PoolHandle>,
    shutdown_tx: Option<watch::Sender<bool>>,
    background: Vec<JoinHandle<()>>,
}

/// Owns the pool and background loops between `start()` and `stop()`.
pub struct LifecycleController {
    deps: WorkerDeps,
    state_tx: watch::Sender<ControllerState>,
    inner: Mutex<ControllerInner>,
}

impl LifecycleController {
    pub fn new(deps: WorkerDeps) -> Self {
        let (state_tx, _) = watch::channel(ControllerState::Stopped);
        Self {
            deps,
            state_tx,
            inner: Mutex::new(ControllerInner::default()),
        }
    }

    pub fn state(&self) -> ControllerState {
        *self.state_tx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ControllerState> {
        self.state_tx.subscribe()
    }

    /// Start pulling and executing tasks. Idempotent when already Running.
    pub async fn start(&self) -> Result<(), ControllerError> {
        let mut inner = self.inner.lock().await;
        match self.state() {
            ControllerState::Running => return Ok(()),
            ControllerState::Stopped => {}
            state => {
                return Err(ControllerError::InvalidState {
                    action: "start",
                    state: state.as_str(),
                });
            }
        }

        self.state_tx.send_replace(ControllerState::Starting);
        self.deps.registry.seal();

        if let Err(e) = self.reconcile_on_start().await {
            self.state_tx.send_replace(ControllerState::Stopped);
            return Err(ControllerError::StartupFailed {
                reason: e.to_string(),
            });
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool = WorkerPool::spawn(self.deps.clone(), shutdown_rx.clone());

        let stuck = self.deps.monitor.spawn_stuck_detector(
            self.deps.store.clone(),
            self.deps.config.stuck_threshold,
            self.deps.config.stuck_check_interval,
            shutdown_rx.clone(),
        );
        let purge = spawn_purge_loop(self.deps.clone(), shutdown_rx);

        inner.pool = Some(pool);
        inner.shutdown_tx = Some(shutdown_tx);
        inner.background = vec![stuck, purge];

        self.state_tx.send_replace(ControllerState::Running);
        tracing::info!(
            pool_size = self.deps.config.pool_size,
            "Scheduler running"
        );
        Ok(())
    }

    /// Stop pulling new messages, drain in-flight work up to `grace`, then
    /// force-cancel the rest. Once this returns, no task is attributed as
    /// Running. Idempotent when already Stopped.
    pub async fn stop(&self, grace: Duration) -> Result<(), ControllerError> {
        let mut inner = self.inner.lock().await;
        match self.state() {
            ControllerState::Stopped => return Ok(()),
            ControllerState::Running => {}
            state => {
                return Err(ControllerError::InvalidState {
                    action: "stop",
                    state: state.as_str(),
                });
            }
        }

        self.state_tx.send_replace(ControllerState::Stopping);
        if let Some(tx) = inner.shutdown_tx.take() {
            let _ = tx.send(true);
        }

        if let Some(mut pool) = inner.pool.take() {
            let drained = tokio::time::timeout(grace, join_all(pool.handles()))
                .await
                .is_ok();
            if !drained {
                tracing::warn!(
                    grace_ms = grace.as_millis() as u64,
                    "Grace period expired, force-cancelling workers"
                );
                pool.abort_all();
            }
        }

        for handle in inner.background.drain(..) {
            handle.abort();
        }

        // Anything still attributed Running was force-cancelled; its delivery
        // was never acked, so the backend will redeliver it. Reflect that.
        self.requeue_running().await;

        self.state_tx.send_replace(ControllerState::Stopped);
        tracing::info!("Scheduler stopped");
        Ok(())
    }

    /// Startup reconciliation: no task stays attributed Running from a prior
    /// run, and non-terminal records absent from the backend are re-enqueued
    /// from their persisted messages.
    async fn reconcile_on_start(&self) -> Result<(), crate::error::Error> {
        self.requeue_running().await;

        let depth = self.deps.adapter.depth().await?;
        if depth > 0 {
            // The backend still holds the messages; it will redeliver.
            return Ok(());
        }

        let orphaned = self.deps.store.non_terminal().await?;
        if orphaned.is_empty() {
            return Ok(());
        }

        tracing::info!(count = orphaned.len(), "Re-enqueueing orphaned tasks");
        for record in orphaned {
            let mut message = record.message;
            // Continue the delivery count where the record left off.
            message.attempt_count = record.status.attempt_count;
            if record.status.state == TaskState::Failed {
                let _ = self
                    .deps
                    .store
                    .try_transition(
                        message.task_id,
                        &[TaskState::Failed],
                        StatusUpdate::to_state(TaskState::Queued),
                    )
                    .await;
            }
            self.deps.adapter.enqueue(&message).await?;
        }
        Ok(())
    }

    /// Best-effort CAS of every Running record back to Queued.
    async fn requeue_running(&self) {
        let running = match self.deps.store.running().await {
            Ok(running) => running,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list running tasks for reconciliation");
                return;
            }
        };

        for status in running {
            match self
                .deps
                .store
                .try_transition(
                    status.task_id,
                    &[TaskState::Running],
                    StatusUpdate::to_state(TaskState::Queued),
                )
                .await
            {
                Ok(_) => {
                    self.deps.monitor.task_finished(status.task_id).await;
                    tracing::info!(
                        task_id = %status.task_id,
                        "Reconciled interrupted task back to queued"
                    );
                }
                Err(e) => {
                    tracing::warn!(task_id = %status.task_id, error = %e, "Reconcile skipped");
                }
            }
        }
    }
}

/// Purge terminal records older than the audit retention window.
fn spawn_purge_loop(deps: WorkerDeps, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let retention = chrono::Duration::from_std(deps.config.audit_retention)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(deps.config.purge_interval) => {
                    let cutoff = Utc::now() - retention;
                    match deps.store.purge_terminal_before(cutoff).await {
                        Ok(0) => {}
                        Ok(purged) => {
                            tracing::info!(purged, "Purged terminal task records");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Audit purge failed");
                        }
                    }
                }
            }
        }
    })
}
