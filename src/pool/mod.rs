//! Execution-context pool.
//!
//! Core components:
//! - `context` — One reusable unit of isolated session state
//! - `manager` — The bounded pool: acquire/release, FIFO waiters, disposal

pub mod context;
pub mod manager;

pub use context::{ContextState, ExecutionContext};
pub use manager::{Pool, PoolState};
