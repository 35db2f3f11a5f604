//! Handler trait and per-execution context.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TaskError;
use crate::memory::MemoryOps;
use crate::task::{ScheduleMessage, TaskLabel};

/// Dependencies a handler sees during one execution.
pub struct HandlerContext {
    /// Memory Ops Facade — the only path handlers use to touch the stores.
    pub memory: Arc<MemoryOps>,
    /// Slot index of the executing worker.
    pub worker_id: usize,
}

/// Business logic for one task label.
///
/// Handlers must be idempotent: at-least-once delivery means a handler can
/// see the same message twice. Cancellation is cooperative — the execution
/// future is dropped when the label's budget expires, so a handler is
/// cancelled at its next await point.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// The label this handler serves.
    fn label(&self) -> TaskLabel;

    /// Execution budget for this label. `None` uses the configured default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Process one message.
    async fn handle(&self, ctx: &HandlerContext, msg: &ScheduleMessage) -> Result<(), TaskError>;
}
