//! MemRead handler — bulk read with vector-index reconciliation.

use async_trait::async_trait;

use crate::error::TaskError;
use crate::task::handler::{HandlerContext, TaskHandler};
use crate::task::message::{ScheduleMessage, TaskLabel, TaskPayload};

/// Reads the requested memories and re-inserts any vectors missing from the
/// index, repairing drift between the text store and the vector store.
pub struct MemReadHandler;

#[async_trait]
impl TaskHandler for MemReadHandler {
    fn label(&self) -> TaskLabel {
        TaskLabel::MemRead
    }

    async fn handle(&self, ctx: &HandlerContext, msg: &ScheduleMessage) -> Result<(), TaskError> {
        let TaskPayload::MemRead { memory_ids } = &msg.payload else {
            return Err(TaskError::HandlerFailed {
                label: self.label(),
                reason: format!("payload variant {} does not match handler", msg.payload.label()),
            });
        };

        let items = ctx.memory.read_and_reconcile(memory_ids).await?;
        tracing::info!(
            task_id = %msg.task_id,
            requested = memory_ids.len(),
            found = items.len(),
            "Read memories"
        );
        Ok(())
    }
}
