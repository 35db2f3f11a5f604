//! mem-scheduler — asynchronous memory-task scheduler.
//!
//! Decouples the synchronous request path (API handlers, answer generation)
//! from slower enrichment work: embedding, vector/graph persistence, and
//! LLM-based memory consolidation. Tasks are submitted as
//! [`task::ScheduleMessage`]s, flow through a pluggable queue backend with
//! at-least-once delivery, and are executed by a fixed-size worker pool under
//! per-label timeouts with per-routing-key ordering.

pub mod config;
pub mod error;
pub mod memory;
pub mod monitor;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod telemetry;
pub mod worker;

pub use config::{BackoffPolicy, SchedulerConfig};
pub use error::{Error, Result};
pub use scheduler::{MemScheduler, SchedulerBuilder};
pub use task::{ScheduleMessage, TaskHandler, TaskLabel, TaskPayload, TaskState, TaskStatus};
