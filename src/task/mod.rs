//! Task types, handler trait, and the label → handler registry.
//!
//! Core components:
//! - `message` — `ScheduleMessage`, the closed `TaskLabel` vocabulary, and
//!   the structured per-label `TaskPayload`
//! - `status` — task state machine (Queued → Running → terminal)
//! - `handler` — `TaskHandler` trait and per-execution context
//! - `registry` — label → handler map, sealed once the scheduler starts
//! - `handlers` — built-in handlers for the memory enrichment labels

pub mod handler;
pub mod handlers;
pub mod message;
pub mod registry;
pub mod status;

pub use handler::{HandlerContext, TaskHandler};
pub use message::{ScheduleMessage, TaskLabel, TaskPayload, TaskPriority};
pub use registry::TaskRegistry;
pub use status::{StatusUpdate, TaskState, TaskStatus};
