//! Add handler — extract facts from raw messages and persist them.

use async_trait::async_trait;

use crate::error::TaskError;
use crate::memory::MemoryItem;
use crate::task::handler::{HandlerContext, TaskHandler};
use crate::task::message::{ScheduleMessage, TaskLabel, TaskPayload};

/// Turns raw conversation messages into durable memories: LLM extraction,
/// then a fan-out write to the text store, vector index, and graph.
pub struct AddHandler;

#[async_trait]
impl TaskHandler for AddHandler {
    fn label(&self) -> TaskLabel {
        TaskLabel::Add
    }

    async fn handle(&self, ctx: &HandlerContext, msg: &ScheduleMessage) -> Result<(), TaskError> {
        let TaskPayload::Add { messages } = &msg.payload else {
            return Err(TaskError::HandlerFailed {
                label: self.label(),
                reason: format!("payload variant {} does not match handler", msg.payload.label()),
            });
        };

        if messages.is_empty() {
            tracing::debug!(task_id = %msg.task_id, "Add task with no messages, nothing to do");
            return Ok(());
        }

        let facts = ctx.memory.extract_memories(messages).await?;
        if facts.is_empty() {
            tracing::debug!(task_id = %msg.task_id, "No memory-worthy facts extracted");
            return Ok(());
        }

        let items: Vec<MemoryItem> = facts
            .into_iter()
            .map(|content| MemoryItem::new(msg.user_id.clone(), msg.mem_cube_id.clone(), content))
            .collect();
        let count = items.len();
        let ids = ctx.memory.add_memories(items).await?;

        tracing::info!(
            task_id = %msg.task_id,
            user_id = %msg.user_id,
            mem_cube_id = %msg.mem_cube_id,
            extracted = count,
            stored = ids.len(),
            "Stored extracted memories"
        );
        Ok(())
    }
}
