//! Scheduler facade — explicit composition of every component.
//!
//! One `MemScheduler` instance per process, created through the builder and
//! held by reference; collaborators are injected, never reached through
//! globals. Behavior comes from the injected trait objects, not inheritance.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{ConfigurationError, Error, Result};
use crate::memory::{Embedder, GraphStore, Llm, MemoryOps, MemoryStore, VectorStore};
use crate::monitor::{HealthSnapshot, Monitor, health_routes};
use crate::queue::{QueueAdapter, QueueBackend};
use crate::store::{InMemoryStateStore, StateStore, SubmitOutcome};
use crate::task::handlers::builtin_handlers;
use crate::task::{
    ScheduleMessage, StatusUpdate, TaskHandler, TaskRegistry, TaskState, TaskStatus,
};
use crate::worker::{LifecycleController, WorkerDeps};

/// The asynchronous memory-task scheduler.
pub struct MemScheduler {
    config: SchedulerConfig,
    registry: Arc<TaskRegistry>,
    adapter: Arc<QueueAdapter>,
    store: Arc<dyn StateStore>,
    memory: Arc<MemoryOps>,
    monitor: Arc<Monitor>,
    controller: LifecycleController,
}

impl MemScheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    // ── Handler registration (before start only) ────────────────────

    /// Register a handler under its label. Fails with a `ConfigurationError`
    /// once the scheduler has started.
    pub async fn register(&self, handler: Arc<dyn TaskHandler>) -> Result<()> {
        self.registry.register(handler).await.map_err(Error::from)
    }

    /// Register the built-in memory enrichment handlers.
    pub async fn register_builtin_handlers(&self) -> Result<()> {
        for handler in builtin_handlers() {
            self.registry.register(handler).await?;
        }
        Ok(())
    }

    // ── Submission ──────────────────────────────────────────────────

    /// Enqueue messages synchronously; does not wait for handler completion.
    ///
    /// Returns one task id per message. A message whose `dedup_key` is held
    /// by a non-terminal task collapses into that task and returns its id.
    pub async fn submit_messages(&self, messages: Vec<ScheduleMessage>) -> Result<Vec<Uuid>> {
        let mut task_ids = Vec::with_capacity(messages.len());

        for message in messages {
            match self.store.submit(&message).await? {
                SubmitOutcome::Duplicate { existing_task_id } => {
                    tracing::info!(
                        task_id = %existing_task_id,
                        dedup_key = ?message.dedup_key,
                        "Duplicate submission collapsed into existing task"
                    );
                    task_ids.push(existing_task_id);
                    continue;
                }
                SubmitOutcome::Created => {}
            }

            if let Err(e) = self.adapter.enqueue(&message).await {
                // The record exists but the backend never took the message;
                // park it where an operator can see it and free the dedup key.
                let _ = self
                    .store
                    .try_transition(
                        message.task_id,
                        &[TaskState::Queued],
                        StatusUpdate::to_state(TaskState::DeadLettered)
                            .with_error(format!("enqueue failed: {e}")),
                    )
                    .await;
                self.monitor.task_dead_lettered();
                return Err(e.into());
            }

            self.monitor.task_submitted();
            tracing::debug!(
                task_id = %message.task_id,
                label = %message.label,
                "Task submitted"
            );
            task_ids.push(message.task_id);
        }

        Ok(task_ids)
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Start the worker pool and background loops. Idempotent when Running.
    pub async fn start(&self) -> Result<()> {
        self.controller.start().await.map_err(Error::from)
    }

    /// Graceful stop: drain in-flight work up to `grace`, force-cancel the
    /// rest, and leave no task attributed as Running.
    pub async fn stop(&self, grace: Duration) -> Result<()> {
        self.controller.stop(grace).await.map_err(Error::from)
    }

    // ── Observability ───────────────────────────────────────────────

    /// Status lookup by task id.
    pub async fn status(&self, task_id: Uuid) -> Result<Option<TaskStatus>> {
        Ok(self.store.get(task_id).await?.map(|r| r.status))
    }

    pub async fn health(&self) -> HealthSnapshot {
        let counters = self.monitor.counters();
        HealthSnapshot {
            state: self.controller.state().to_string(),
            degraded: self.monitor.is_degraded(),
            queued: self.adapter.depth().await.unwrap_or(0),
            running: self.monitor.running_count().await,
            dead_lettered: counters.dead_lettered,
            succeeded: counters.succeeded,
            failed: counters.failed,
            stale_workers: self
                .monitor
                .stale_workers(self.config.heartbeat_stale_after)
                .await
                .len(),
        }
    }

    /// Axum router exposing `GET /health`.
    pub fn health_router(self: &Arc<Self>) -> Router {
        health_routes(Arc::clone(self))
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    /// Direct access to the Memory Ops Facade for synchronous callers.
    pub fn memory_ops(&self) -> &Arc<MemoryOps> {
        &self.memory
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }
}

/// Builder wiring collaborators into a scheduler instance.
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    memory_store: Option<Arc<dyn MemoryStore>>,
    embedder: Option<Arc<dyn Embedder>>,
    vector_store: Option<Arc<dyn VectorStore>>,
    graph_store: Option<Arc<dyn GraphStore>>,
    llm: Option<Arc<dyn Llm>>,
    state_store: Option<Arc<dyn StateStore>>,
    backend: Option<Arc<dyn QueueBackend>>,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self {
            config: SchedulerConfig::default(),
            memory_store: None,
            embedder: None,
            vector_store: None,
            graph_store: None,
            llm: None,
            state_store: None,
            backend: None,
        }
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn memory_store(mut self, store: Arc<dyn MemoryStore>) -> Self {
        self.memory_store = Some(store);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.vector_store = Some(store);
        self
    }

    pub fn graph_store(mut self, store: Arc<dyn GraphStore>) -> Self {
        self.graph_store = Some(store);
        self
    }

    pub fn llm(mut self, llm: Arc<dyn Llm>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Durable state store. Defaults to the in-memory store.
    pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    /// Explicit queue backend, overriding `config.queue`.
    pub fn queue_backend(mut self, backend: Arc<dyn QueueBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn build(self) -> Result<MemScheduler> {
        fn require<T>(
            value: Option<T>,
            name: &'static str,
        ) -> std::result::Result<T, ConfigurationError> {
            value.ok_or(ConfigurationError::InvalidValue {
                key: name.to_string(),
                message: "collaborator must be injected at construction".to_string(),
            })
        }

        let memory = Arc::new(
            MemoryOps::new(
                require(self.memory_store, "memory_store")?,
                require(self.embedder, "embedder")?,
                require(self.vector_store, "vector_store")?,
                require(self.graph_store, "graph_store")?,
                require(self.llm, "llm")?,
            )
            .with_retry_policy(
                self.config.memory_retry_attempts,
                self.config.memory_retry_backoff.clone(),
            ),
        );

        let monitor = Arc::new(Monitor::new());
        let backend = self
            .backend
            .unwrap_or_else(|| self.config.queue.build());
        let adapter = Arc::new(QueueAdapter::new(
            backend,
            monitor.clone(),
            self.config.backend_backoff.clone(),
        ));
        let store: Arc<dyn StateStore> = self
            .state_store
            .unwrap_or_else(|| Arc::new(InMemoryStateStore::new()));
        let registry = Arc::new(TaskRegistry::new(self.config.handler_timeout));

        let deps = WorkerDeps {
            config: self.config.clone(),
            adapter: adapter.clone(),
            registry: registry.clone(),
            store: store.clone(),
            monitor: monitor.clone(),
            memory: memory.clone(),
        };

        Ok(MemScheduler {
            config: self.config,
            registry,
            adapter,
            store,
            memory,
            monitor,
            controller: LifecycleController::new(deps),
        })
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
