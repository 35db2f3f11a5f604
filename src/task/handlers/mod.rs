//! Built-in handlers for the memory enrichment labels.
//!
//! Each handler serves one label and reaches the stores exclusively through
//! the Memory Ops Facade. All are idempotent under redelivery.

mod add;
mod mem_read;
mod mem_update;
mod query;

use std::sync::Arc;

pub use add::AddHandler;
pub use mem_read::MemReadHandler;
pub use mem_update::MemUpdateHandler;
pub use query::QueryHandler;

use crate::task::handler::TaskHandler;

/// The handlers shipped with the scheduler, ready for registration.
pub fn builtin_handlers() -> Vec<Arc<dyn TaskHandler>> {
    vec![
        Arc::new(AddHandler) as Arc<dyn TaskHandler>,
        Arc::new(QueryHandler),
        Arc::new(MemReadHandler),
        Arc::new(MemUpdateHandler),
    ]
}
