//! Worker pool — bounded concurrent task execution with per-key ordering.
//!
//! One consumer loop pulls batches from the queue adapter and routes each
//! delivery to a worker slot by consistent hashing over the routing key.
//! Slots process sequentially, so two tasks mutating the same memory cube
//! never execute concurrently and keep their relative submission order.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::SchedulerConfig;
use crate::error::{StateStoreError, TaskError};
use crate::memory::MemoryOps;
use crate::monitor::Monitor;
use crate::queue::{Delivery, QueueAdapter};
use crate::store::StateStore;
use crate::task::{HandlerContext, StatusUpdate, TaskRegistry, TaskState};

/// Shared dependencies for worker execution.
#[derive(Clone)]
pub struct WorkerDeps {
    pub config: SchedulerConfig,
    pub adapter: Arc<QueueAdapter>,
    pub registry: Arc<TaskRegistry>,
    pub store: Arc<dyn StateStore>,
    pub monitor: Arc<Monitor>,
    pub memory: Arc<MemoryOps>,
}

/// Join handles for a spawned pool.
pub struct PoolHandle {
    pub consumer: JoinHandle<()>,
    pub slots: Vec<JoinHandle<()>>,
}

impl PoolHandle {
    /// All handles, consumer first.
    pub fn handles(&mut self) -> Vec<&mut JoinHandle<()>> {
        std::iter::once(&mut self.consumer)
            .chain(self.slots.iter_mut())
            .collect()
    }

    pub fn abort_all(&self) {
        self.consumer.abort();
        for slot in &self.slots {
            slot.abort();
        }
    }
}

/// Spawns and wires the consumer and slot loops.
pub struct WorkerPool;

impl WorkerPool {
    pub fn spawn(deps: WorkerDeps, shutdown: watch::Receiver<bool>) -> PoolHandle {
        let pool_size = deps.config.pool_size.max(1);
        let mut slot_txs = Vec::with_capacity(pool_size);
        let mut slots = Vec::with_capacity(pool_size);

        for worker_id in 0..pool_size {
            let (tx, rx) = mpsc::channel(deps.config.slot_queue_capacity.max(1));
            slot_txs.push(tx);
            slots.push(tokio::spawn(slot_loop(
                worker_id,
                rx,
                deps.clone(),
                shutdown.clone(),
            )));
        }

        let consumer = tokio::spawn(consumer_loop(deps, slot_txs, shutdown));
        PoolHandle { consumer, slots }
    }
}

/// Stable slot index for a routing key.
fn route_slot(routing_key: &str, pool_size: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    routing_key.hash(&mut hasher);
    (hasher.finish() % pool_size as u64) as usize
}

async fn consumer_loop(
    deps: WorkerDeps,
    slot_txs: Vec<mpsc::Sender<Delivery>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let batch = deps.config.consume_batch.max(1);
    let wait = deps.config.dequeue_wait;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let deliveries = tokio::select! {
            _ = shutdown.changed() => continue,
            result = deps.adapter.dequeue(batch, wait) => match result {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    tracing::error!(error = %e, "Dequeue failed");
                    continue;
                }
            },
        };

        for delivery in deliveries {
            let slot = route_slot(&delivery.message.routing_key(), slot_txs.len());
            if slot_txs[slot].send(delivery).await.is_err() {
                // Slot gone — the pool is tearing down.
                return;
            }
        }
    }
    // Dropping slot_txs closes the slot channels; slots drain and exit.
}

async fn slot_loop(
    worker_id: usize,
    mut rx: mpsc::Receiver<Delivery>,
    deps: WorkerDeps,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!(worker_id, "Worker slot started");
    // Tick often enough that an idle slot never reads as stale.
    let heartbeat_period = deps.config.heartbeat_stale_after / 2;

    loop {
        deps.monitor.heartbeat(worker_id).await;

        let delivery = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
            _ = tokio::time::sleep(heartbeat_period) => continue,
            delivery = rx.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };

        execute_delivery(worker_id, delivery, &deps).await;
    }

    // Shutdown: anything already routed here but never started goes straight
    // back to the backend so it is not stranded in a closed channel.
    while let Ok(delivery) = rx.try_recv() {
        if let Err(e) = deps.adapter.nack(&delivery.handle, Duration::ZERO).await {
            tracing::warn!(
                task_id = %delivery.message.task_id,
                error = %e,
                "Failed to requeue undispatched delivery at shutdown"
            );
        }
    }
    tracing::debug!(worker_id, "Worker slot stopped");
}

async fn execute_delivery(worker_id: usize, delivery: Delivery, deps: &WorkerDeps) {
    let msg = &delivery.message;
    let task_id = msg.task_id;

    let Some((handler, timeout)) = deps.registry.resolve(msg.label).await else {
        // Retrying cannot make the label resolvable: dead-letter immediately.
        let error = TaskError::UnknownLabel { label: msg.label };
        tracing::error!(task_id = %task_id, label = %msg.label, "Task dead-lettered: {error}");
        let update = StatusUpdate::to_state(TaskState::DeadLettered)
            .with_attempt(msg.attempt_count)
            .with_error(error.to_string());
        if let Err(e) = deps
            .store
            .try_transition(task_id, &[TaskState::Queued, TaskState::Failed], update)
            .await
        {
            tracing::warn!(task_id = %task_id, error = %e, "Dead-letter transition rejected");
        }
        deps.monitor.task_dead_lettered();
        let _ = deps.adapter.ack(&delivery.handle).await;
        return;
    };

    // Claim the task. A stale redelivery of an already-settled (or currently
    // owned) task loses this CAS and is dropped here.
    let claim = deps
        .store
        .try_transition(
            task_id,
            &[TaskState::Queued, TaskState::Failed],
            StatusUpdate::to_state(TaskState::Running)
                .with_attempt(msg.attempt_count)
                .with_worker(worker_id),
        )
        .await;

    match claim {
        Ok(_) => {}
        Err(StateStoreError::CasConflict { actual, .. }) => {
            tracing::warn!(
                task_id = %task_id,
                state = %actual,
                "Skipping stale redelivery"
            );
            let _ = deps.adapter.ack(&delivery.handle).await;
            return;
        }
        Err(StateStoreError::NotFound { .. }) => {
            tracing::warn!(task_id = %task_id, "Delivery without a state record, dropping");
            let _ = deps.adapter.ack(&delivery.handle).await;
            return;
        }
        Err(e) => {
            tracing::error!(task_id = %task_id, error = %e, "State store claim failed");
            let _ = deps
                .adapter
                .nack(&delivery.handle, deps.config.retry_backoff.delay(1))
                .await;
            return;
        }
    }

    deps.monitor.task_started(task_id, worker_id, msg.label).await;
    tracing::debug!(
        task_id = %task_id,
        label = %msg.label,
        worker_id,
        attempt = msg.attempt_count,
        "Task started"
    );

    let ctx = HandlerContext {
        memory: deps.memory.clone(),
        worker_id,
    };
    // Dropping the handler future at the deadline is the cancellation signal:
    // the handler stops at its next await point.
    let result = tokio::time::timeout(timeout, handler.handle(&ctx, msg)).await;
    deps.monitor.task_finished(task_id).await;

    match result {
        Ok(Ok(())) => settle_success(worker_id, &delivery, deps).await,
        Ok(Err(e)) => settle_failure(&delivery, deps, e.to_string()).await,
        Err(_) => {
            let error = TaskError::HandlerTimeout {
                label: msg.label,
                timeout,
            };
            settle_failure(&delivery, deps, error.to_string()).await;
        }
    }
}

async fn settle_success(worker_id: usize, delivery: &Delivery, deps: &WorkerDeps) {
    let task_id = delivery.message.task_id;
    match deps
        .store
        .try_transition(
            task_id,
            &[TaskState::Running],
            StatusUpdate::to_state(TaskState::Succeeded),
        )
        .await
    {
        Ok(status) => {
            deps.monitor.task_succeeded();
            let _ = deps.adapter.ack(&delivery.handle).await;
            tracing::info!(
                task_id = %task_id,
                label = %delivery.message.label,
                worker_id,
                attempts = status.attempt_count,
                "Task succeeded"
            );
        }
        Err(StateStoreError::CasConflict { actual, .. }) if !actual.is_terminal() => {
            // The stuck sweep force-failed us mid-run. The work is done but
            // the record says otherwise; hand the message back for a prompt,
            // idempotent re-run.
            tracing::warn!(task_id = %task_id, state = %actual, "Success lost race, requeueing");
            let _ = deps.adapter.nack(&delivery.handle, Duration::ZERO).await;
        }
        Err(e) => {
            tracing::warn!(task_id = %task_id, error = %e, "Success transition rejected");
            let _ = deps.adapter.ack(&delivery.handle).await;
        }
    }
}

async fn settle_failure(delivery: &Delivery, deps: &WorkerDeps, error: String) {
    let msg = &delivery.message;
    let task_id = msg.task_id;

    if msg.attempt_count >= deps.config.max_retries {
        // Exhausted: settle the delivery and park the task for an operator.
        let update = StatusUpdate::to_state(TaskState::DeadLettered)
            .with_attempt(msg.attempt_count)
            .with_error(error.clone());
        if let Err(e) = deps
            .store
            .try_transition(task_id, &[TaskState::Running, TaskState::Failed], update)
            .await
        {
            tracing::warn!(task_id = %task_id, error = %e, "Dead-letter transition rejected");
        }
        deps.monitor.task_failed();
        deps.monitor.task_dead_lettered();
        let _ = deps.adapter.ack(&delivery.handle).await;
        tracing::error!(
            task_id = %task_id,
            label = %msg.label,
            attempts = msg.attempt_count,
            error = %error,
            "Task dead-lettered after exhausting retries"
        );
        return;
    }

    let delay = deps.config.retry_backoff.delay(msg.attempt_count);
    let failed = StatusUpdate::to_state(TaskState::Failed)
        .with_attempt(msg.attempt_count)
        .with_error(error.clone());
    if let Err(e) = deps
        .store
        .try_transition(task_id, &[TaskState::Running], failed)
        .await
    {
        tracing::warn!(task_id = %task_id, error = %e, "Failure transition rejected");
    }
    deps.monitor.task_failed();

    if let Err(e) = deps.adapter.nack(&delivery.handle, delay).await {
        tracing::error!(task_id = %task_id, error = %e, "Nack failed, relying on visibility timeout");
    }
    deps.monitor.task_retried();

    // Reflect "waiting for redelivery" in the record; a racing redelivery may
    // already own the task, which is fine.
    if let Err(e) = deps
        .store
        .try_transition(
            task_id,
            &[TaskState::Failed],
            StatusUpdate::to_state(TaskState::Queued),
        )
        .await
    {
        tracing::debug!(task_id = %task_id, error = %e, "Requeue transition skipped");
    }

    tracing::warn!(
        task_id = %task_id,
        label = %msg.label,
        attempt = msg.attempt_count,
        delay_ms = delay.as_millis() as u64,
        error = %error,
        "Task failed, scheduled for redelivery"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_is_stable_and_in_range() {
        for pool_size in [1usize, 2, 4, 7] {
            for key in ["u1:cube-1", "u2:cube-9", "alice:work"] {
                let a = route_slot(key, pool_size);
                let b = route_slot(key, pool_size);
                assert_eq!(a, b, "routing must be deterministic");
                assert!(a < pool_size);
            }
        }
    }

    #[test]
    fn distinct_keys_spread_across_slots() {
        let pool_size = 8;
        let slots: std::collections::HashSet<usize> = (0..100)
            .map(|i| route_slot(&format!("user-{i}:cube-{i}"), pool_size))
            .collect();
        // 100 keys over 8 slots: all slots should see traffic.
        assert!(slots.len() > 1, "hashing must not collapse to one slot");
    }
}
