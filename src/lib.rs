//! # tether
//!
//! Concurrency primitives for handing work and results between threads:
//! a lock-free MPMC queue, single-assignment futures, and background tasks
//! with retries and delayed start.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use tether::context::Context;
//! use tether::queue::LockFreeQueue;
//! use tether::task::AsyncTask;
//!
//! let queue = LockFreeQueue::new();
//! queue.enqueue("job");
//! assert_eq!(queue.poll(Duration::from_millis(10)), Some("job"));
//!
//! let (ctx, _cancel) = Context::with_timeout(&Context::background(), Duration::from_secs(5));
//! let task = AsyncTask::new(&ctx, |_ctx: &Context| "42".parse::<u32>(), 3);
//! task.execute_async();
//! assert_eq!(task.wait().unwrap(), 42);
//! ```

// ── Primitives ────────────────────────────────────────────────────────────────
pub mod context;
pub mod future;
pub mod queue;

// ── Tasks built on futures ────────────────────────────────────────────────────
pub mod task;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use context::{CancelHandle, Context, ContextError};
pub use future::{BoxError, Future, SharedError, TaskError};
pub use queue::LockFreeQueue;
pub use task::{AsyncTask, RetryPolicy, ScheduledTask};
