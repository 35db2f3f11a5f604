//! Query handler — refresh retrieval state for an incoming user query.

use async_trait::async_trait;

use crate::error::TaskError;
use crate::task::handler::{HandlerContext, TaskHandler};
use crate::task::message::{ScheduleMessage, TaskLabel, TaskPayload};

const DEFAULT_TOP_K: usize = 10;

/// Runs hybrid retrieval for the query and records which memories it
/// surfaced as access edges in the graph.
pub struct QueryHandler;

#[async_trait]
impl TaskHandler for QueryHandler {
    fn label(&self) -> TaskLabel {
        TaskLabel::Query
    }

    async fn handle(&self, ctx: &HandlerContext, msg: &ScheduleMessage) -> Result<(), TaskError> {
        let TaskPayload::Query { query, top_k } = &msg.payload else {
            return Err(TaskError::HandlerFailed {
                label: self.label(),
                reason: format!("payload variant {} does not match handler", msg.payload.label()),
            });
        };

        let top_k = top_k.unwrap_or(DEFAULT_TOP_K);
        let hits = ctx
            .memory
            .search_memories(&msg.user_id, &msg.mem_cube_id, query, top_k)
            .await?;

        // The task id doubles as the query node id, keeping redelivered
        // executions idempotent in the graph.
        let query_id = msg.task_id.to_string();
        ctx.memory
            .link_query_hits(&msg.user_id, &query_id, &hits)
            .await?;

        tracing::info!(
            task_id = %msg.task_id,
            user_id = %msg.user_id,
            hits = hits.len(),
            "Recorded query access edges"
        );
        Ok(())
    }
}
