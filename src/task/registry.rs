//! Task registry — maps labels to handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::RwLock;

use crate::error::ConfigurationError;
use crate::task::handler::TaskHandler;
use crate::task::message::TaskLabel;

struct RegisteredHandler {
    handler: Arc<dyn TaskHandler>,
    timeout: Duration,
}

/// Registry of task handlers.
///
/// Registration happens before the scheduler starts; `seal()` is called by
/// the lifecycle controller at startup and any registration afterwards fails
/// with a `ConfigurationError`.
pub struct TaskRegistry {
    handlers: RwLock<HashMap<TaskLabel, RegisteredHandler>>,
    sealed: AtomicBool,
    default_timeout: Duration,
}

impl TaskRegistry {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            sealed: AtomicBool::new(false),
            default_timeout,
        }
    }

    /// Register a handler under its own label, using the handler's declared
    /// timeout or the configured default.
    pub async fn register(&self, handler: Arc<dyn TaskHandler>) -> Result<(), ConfigurationError> {
        let timeout = handler.timeout().unwrap_or(self.default_timeout);
        self.register_with_timeout(handler, timeout).await
    }

    /// Register a handler with an explicit per-label execution budget.
    pub async fn register_with_timeout(
        &self,
        handler: Arc<dyn TaskHandler>,
        timeout: Duration,
    ) -> Result<(), ConfigurationError> {
        let label = handler.label();
        if self.sealed.load(Ordering::Acquire) {
            return Err(ConfigurationError::RegistrySealed { label });
        }

        let mut handlers = self.handlers.write().await;
        if handlers.contains_key(&label) {
            return Err(ConfigurationError::DuplicateHandler { label });
        }
        handlers.insert(label, RegisteredHandler { handler, timeout });
        tracing::debug!(label = %label, timeout_ms = timeout.as_millis() as u64, "Registered handler");
        Ok(())
    }

    /// Freeze the registry. Called once when the scheduler starts.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Resolve a label to its handler and execution budget.
    pub async fn resolve(&self, label: TaskLabel) -> Option<(Arc<dyn TaskHandler>, Duration)> {
        self.handlers
            .read()
            .await
            .get(&label)
            .map(|r| (r.handler.clone(), r.timeout))
    }

    /// Labels with a registered handler.
    pub async fn labels(&self) -> Vec<TaskLabel> {
        self.handlers.read().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.handlers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.handlers.read().await.is_empty()
    }
}
