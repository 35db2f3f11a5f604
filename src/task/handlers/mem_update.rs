//! MemUpdate handler — rewrite a memory's content.

use async_trait::async_trait;

use crate::error::TaskError;
use crate::task::handler::{HandlerContext, TaskHandler};
use crate::task::message::{ScheduleMessage, TaskLabel, TaskPayload};

/// Replaces an item's content in the text store and refreshes its embedding.
pub struct MemUpdateHandler;

#[async_trait]
impl TaskHandler for MemUpdateHandler {
    fn label(&self) -> TaskLabel {
        TaskLabel::MemUpdate
    }

    async fn handle(&self, ctx: &HandlerContext, msg: &ScheduleMessage) -> Result<(), TaskError> {
        let TaskPayload::MemUpdate {
            memory_id,
            new_content,
        } = &msg.payload
        else {
            return Err(TaskError::HandlerFailed {
                label: self.label(),
                reason: format!("payload variant {} does not match handler", msg.payload.label()),
            });
        };

        ctx.memory.update_memory(memory_id, new_content).await?;
        tracing::info!(
            task_id = %msg.task_id,
            memory_id = %memory_id,
            "Updated memory content"
        );
        Ok(())
    }
}
