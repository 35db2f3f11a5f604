//! Durable per-task state records.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStateStore;
pub use memory::InMemoryStateStore;
pub use traits::{StateStore, SubmitOutcome, TaskRecord};
