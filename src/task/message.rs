//! Schedule messages — the unit of deferred work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task-type label. Closed enumeration: the scheduler's task vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskLabel {
    /// A user query arrived; refresh working memory for it.
    Query,
    /// An assistant answer was produced; consolidate it into memory.
    Answer,
    /// Add raw messages to long-term memory.
    Add,
    /// Bulk-read memories and repair missing vector entries.
    MemRead,
    /// Rewrite the content of an existing memory.
    MemUpdate,
    /// Restructure memories within a cube.
    MemReorganize,
    /// Record a user preference.
    PrefAdd,
    /// Apply user feedback to a memory.
    MemFeedback,
}

impl TaskLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Answer => "answer",
            Self::Add => "add",
            Self::MemRead => "mem_read",
            Self::MemUpdate => "mem_update",
            Self::MemReorganize => "mem_reorganize",
            Self::PrefAdd => "pref_add",
            Self::MemFeedback => "mem_feedback",
        }
    }

    /// All labels, in declaration order.
    pub fn all() -> &'static [TaskLabel] {
        &[
            Self::Query,
            Self::Answer,
            Self::Add,
            Self::MemRead,
            Self::MemUpdate,
            Self::MemReorganize,
            Self::PrefAdd,
            Self::MemFeedback,
        ]
    }
}

impl std::fmt::Display for TaskLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured task payload, one variant per label.
///
/// The variant IS the contract between submitter and handler: field names are
/// checked at compile time on both sides, so a handler cannot read a key the
/// submitter never wrote.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    Query {
        query: String,
        top_k: Option<usize>,
    },
    Answer {
        question: String,
        answer: String,
    },
    Add {
        messages: Vec<String>,
    },
    MemRead {
        memory_ids: Vec<String>,
    },
    MemUpdate {
        memory_id: String,
        new_content: String,
    },
    MemReorganize {
        scope: Option<String>,
    },
    PrefAdd {
        preference: String,
    },
    MemFeedback {
        memory_id: String,
        feedback: String,
    },
}

impl TaskPayload {
    /// The label this payload belongs to.
    pub fn label(&self) -> TaskLabel {
        match self {
            Self::Query { .. } => TaskLabel::Query,
            Self::Answer { .. } => TaskLabel::Answer,
            Self::Add { .. } => TaskLabel::Add,
            Self::MemRead { .. } => TaskLabel::MemRead,
            Self::MemUpdate { .. } => TaskLabel::MemUpdate,
            Self::MemReorganize { .. } => TaskLabel::MemReorganize,
            Self::PrefAdd { .. } => TaskLabel::PrefAdd,
            Self::MemFeedback { .. } => TaskLabel::MemFeedback,
        }
    }
}

/// Delivery priority. Honored by the broker backend; the stream backend
/// delivers in arrival order regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    High,
    Normal,
    Low,
}

impl TaskPriority {
    /// Rank for ordering: lower rank delivers first.
    pub fn rank(&self) -> u8 {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }
}

/// A unit of deferred work submitted to the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleMessage {
    /// Globally unique, assigned at submission, immutable.
    pub task_id: Uuid,
    /// Task-type label; always matches the payload variant.
    pub label: TaskLabel,
    /// User that owns the memories this task touches.
    pub user_id: String,
    /// Memory cube the task operates on. Also the ordering key.
    pub mem_cube_id: String,
    /// Structured task content.
    pub payload: TaskPayload,
    /// When the message was submitted.
    pub submitted_at: DateTime<Utc>,
    /// Optional delivery priority.
    pub priority: Option<TaskPriority>,
    /// Optional deduplication key: at most one non-terminal task per key.
    pub dedup_key: Option<String>,
    /// 0 at submission; the queue backend increments it on every delivery,
    /// so a delivered message carries its delivery ordinal.
    pub attempt_count: u32,
}

impl ScheduleMessage {
    /// Create a message. The label is derived from the payload variant, so a
    /// label/payload mismatch cannot be constructed.
    pub fn new(
        user_id: impl Into<String>,
        mem_cube_id: impl Into<String>,
        payload: TaskPayload,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            label: payload.label(),
            user_id: user_id.into(),
            mem_cube_id: mem_cube_id.into(),
            payload,
            submitted_at: Utc::now(),
            priority: None,
            dedup_key: None,
            attempt_count: 0,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    /// Routing key: all messages sharing it execute on the same worker slot,
    /// preserving their relative submission order.
    pub fn routing_key(&self) -> String {
        format!("{}:{}", self.user_id, self.mem_cube_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_derived_from_payload() {
        let msg = ScheduleMessage::new(
            "u1",
            "cube-1",
            TaskPayload::Add {
                messages: vec!["remember this".into()],
            },
        );
        assert_eq!(msg.label, TaskLabel::Add);
        assert_eq!(msg.attempt_count, 0);
        assert!(msg.dedup_key.is_none());
    }

    #[test]
    fn routing_key_combines_user_and_cube() {
        let msg = ScheduleMessage::new("u1", "cube-1", TaskPayload::MemReorganize { scope: None });
        assert_eq!(msg.routing_key(), "u1:cube-1");
    }

    #[test]
    fn label_serde_snake_case() {
        let json = serde_json::to_string(&TaskLabel::MemUpdate).unwrap();
        assert_eq!(json, "\"mem_update\"");
        let parsed: TaskLabel = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, TaskLabel::MemUpdate);
    }

    #[test]
    fn payload_roundtrip_is_tagged() {
        let payload = TaskPayload::Query {
            query: "what do I like?".into(),
            top_k: Some(5),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "query");
        let parsed: TaskPayload = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.label(), TaskLabel::Query);
    }

    #[test]
    fn message_roundtrip_preserves_attempts() {
        let mut msg = ScheduleMessage::new(
            "u2",
            "cube-9",
            TaskPayload::PrefAdd {
                preference: "dark roast".into(),
            },
        )
        .with_dedup_key("pref:u2:dark-roast")
        .with_priority(TaskPriority::Low);
        msg.attempt_count = 2;

        let json = serde_json::to_string(&msg).unwrap();
        let parsed: ScheduleMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.task_id, msg.task_id);
        assert_eq!(parsed.attempt_count, 2);
        assert_eq!(parsed.priority, Some(TaskPriority::Low));
        assert_eq!(parsed.dedup_key.as_deref(), Some("pref:u2:dark-roast"));
    }

    #[test]
    fn priority_ranks_order_high_first() {
        assert!(TaskPriority::High.rank() < TaskPriority::Normal.rank());
        assert!(TaskPriority::Normal.rank() < TaskPriority::Low.rank());
    }
}
