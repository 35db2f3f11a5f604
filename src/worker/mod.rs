//! Worker pool and lifecycle control.
//!
//! Core components:
//! - `pool` — consumer loop + fixed worker slots with consistent-hash routing
//! - `controller` — Stopped → Starting → Running → Stopping state machine,
//!   graceful drain, and startup/shutdown reconciliation

pub mod controller;
pub mod pool;

pub use controller::{ControllerState, LifecycleController};
pub use pool::{PoolHandle, WorkerDeps, WorkerPool};
