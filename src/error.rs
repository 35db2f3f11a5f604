//! Error types for the memory-task scheduler.

use std::time::Duration;

use uuid::Uuid;

use crate::task::{TaskLabel, TaskState};

/// Top-level error type for the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigurationError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Controller error: {0}")]
    Controller(#[from] ControllerError),

    #[error("Memory ops error: {0}")]
    Memory(#[from] MemoryError),

    #[error("State store error: {0}")]
    State(#[from] StateStoreError),
}

/// Configuration errors. Fatal — raised only at registration or startup,
/// and prevent the scheduler from entering Running.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Handler registry is sealed; cannot register {label} after start()")]
    RegistrySealed { label: TaskLabel },

    #[error("A handler for {label} is already registered")]
    DuplicateHandler { label: TaskLabel },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Queue backend errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue backend {backend} unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    #[error("Queue backend is at capacity ({capacity} messages)")]
    Full { capacity: usize },

    #[error("Unknown delivery handle {delivery_id} (already acked or reclaimed)")]
    UnknownDelivery { delivery_id: Uuid },

    #[error("Message serialization failed: {0}")]
    Serialization(String),
}

impl QueueError {
    /// Whether the adapter should back off and retry.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Task execution errors, produced inside the worker loop.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("No handler registered for label {label}")]
    UnknownLabel { label: TaskLabel },

    #[error("Handler for {label} exceeded its {timeout:?} budget")]
    HandlerTimeout { label: TaskLabel, timeout: Duration },

    #[error("Handler for {label} failed: {reason}")]
    HandlerFailed { label: TaskLabel, reason: String },

    #[error("Memory ops error: {0}")]
    Memory(#[from] MemoryError),
}

/// Memory Ops Facade errors.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Transient I/O failure — retried inside the facade before surfacing.
    #[error("Transient failure in {op}: {reason}")]
    Transient { op: &'static str, reason: String },

    #[error("Permanent failure in {op}: {reason}")]
    Permanent { op: &'static str, reason: String },

    #[error("Memory item not found: {id}")]
    NotFound { id: String },

    #[error("Embedding output mismatch: expected {expected} vectors, got {got}")]
    EmbeddingMismatch { expected: usize, got: usize },
}

impl MemoryError {
    /// Whether the facade-level retry applies.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Lifecycle controller errors.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("Cannot {action} while the scheduler is {state}")]
    InvalidState { action: &'static str, state: &'static str },

    #[error("Scheduler startup failed: {reason}")]
    StartupFailed { reason: String },
}

/// State store errors.
#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("Task {task_id} not found")]
    NotFound { task_id: Uuid },

    #[error("Task {task_id} state is {actual}, transition to {requested} rejected")]
    CasConflict {
        task_id: Uuid,
        actual: TaskState,
        requested: TaskState,
    },

    #[error("State store backend error: {0}")]
    Backend(String),

    #[error("Record serialization failed: {0}")]
    Serialization(String),
}

/// Result type alias for the scheduler.
pub type Result<T> = std::result::Result<T, Error>;
