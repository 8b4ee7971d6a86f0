//! Background tasks — fallible operations run on a worker thread with retries.
//!
//! An [`AsyncTask`] owns an operation, a [`RetryPolicy`] and the [`Future`] its
//! outcome is published to. [`AsyncTask::execute_async`] starts a worker that
//! runs the operation until it succeeds, the retry budget is spent, or the
//! task is cancelled. [`ScheduledTask`] defers that start to a point in time.
//!
//! ## Retry convention
//!
//! Attempts are numbered from zero. A task built with `retries = N` runs at most
//! `N + 1` attempts (`0..=N`) and, if every one fails, settles with
//! `attempt N has failed: <cause>`. Retries follow each other immediately;
//! callers that want backoff can sleep inside the operation.
//!
//! ## Cancellation
//!
//! Cancellation is cooperative. The worker checks the task's [`Context`] and
//! whether the future was settled by [`AsyncTask::cancel`] before every
//! attempt, and checks the context again after a failed attempt so a stopped
//! context never consumes a retry. An attempt that is already running is not
//! interrupted.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::Context;
use crate::future::{BoxError, Future, TaskError};

pub mod scheduled;

pub use scheduled::ScheduledTask;

/// How many times a failed operation is retried.
///
/// Deserializes from `{"limited": 3}` or `"unlimited"`.
///
/// # Examples
///
/// ```
/// use tether::task::RetryPolicy;
///
/// assert_eq!(RetryPolicy::from(3), RetryPolicy::Limited(3));
/// assert_eq!(RetryPolicy::from(-1), RetryPolicy::Unlimited);
/// assert!(RetryPolicy::Limited(1).permits_retry(0));
/// assert!(!RetryPolicy::Limited(1).permits_retry(1));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Retry at most this many times after the first attempt.
    Limited(u32),
    /// Retry until the operation succeeds or the task is cancelled.
    Unlimited,
}

impl RetryPolicy {
    /// Returns `true` if another attempt may follow the failed attempt number `attempt`.
    pub fn permits_retry(self, attempt: u64) -> bool {
        match self {
            Self::Limited(retries) => attempt < u64::from(retries),
            Self::Unlimited => true,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Limited(0)
    }
}

/// Negative counts mean unlimited retries.
impl From<i32> for RetryPolicy {
    fn from(retries: i32) -> Self {
        u32::try_from(retries).map_or(Self::Unlimited, Self::Limited)
    }
}

type Operation<R> = Box<dyn Fn(&Context) -> Result<R, BoxError> + Send + Sync>;

struct TaskInner<R> {
    ctx: Context,
    operation: Operation<R>,
    policy: RetryPolicy,
    future: Future<R>,
    // First settled result seen by `wait`, so later calls skip the future's lock.
    done: RwLock<Option<Result<R, TaskError>>>,
    started: AtomicBool,
    attempts: AtomicU64,
}

impl<R> TaskInner<R> {
    fn run(&self) {
        let mut attempt: u64 = 0;

        loop {
            if self.future.is_settled() {
                debug!(attempt, "task settled before attempt, stopping");
                return;
            }
            if let Some(cause) = self.ctx.err() {
                debug!(attempt, %cause, "context stopped before attempt");
                self.future.fail(cause.into());
                return;
            }

            self.attempts.fetch_add(1, Ordering::Relaxed);
            let err = match self.attempt() {
                Ok(value) => {
                    if self.future.complete(value) {
                        debug!(attempt, "task completed");
                    }
                    return;
                }
                Err(err) => err,
            };

            if let Some(cause) = self.ctx.err() {
                debug!(attempt, error = %err, %cause, "attempt failed after context stopped");
                self.future.fail(cause.into());
                return;
            }

            if !self.policy.permits_retry(attempt) {
                debug!(attempt, error = %err, "retries exhausted");
                self.future.fail(TaskError::AttemptFailed {
                    attempt,
                    source: Arc::from(err),
                });
                return;
            }

            debug!(attempt, error = %err, "attempt failed, retrying");
            attempt += 1;
        }
    }

    // A panicking operation counts as a failed attempt.
    fn attempt(&self) -> Result<R, BoxError> {
        panic::catch_unwind(AssertUnwindSafe(|| (self.operation)(&self.ctx)))
            .unwrap_or_else(|payload| Err(panic_message(payload).into()))
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned());

    match detail {
        Some(detail) => format!("operation panicked: {detail}"),
        None => "operation panicked".to_owned(),
    }
}

/// A fallible operation executed in the background with a retry policy.
///
/// `AsyncTask` is a cheap handle; clones share the same task.
///
/// # Examples
///
/// ```
/// use std::sync::atomic::{AtomicU32, Ordering};
/// use tether::context::Context;
/// use tether::task::AsyncTask;
///
/// let calls = AtomicU32::new(0);
/// let task = AsyncTask::new(
///     &Context::background(),
///     move |_ctx: &Context| {
///         if calls.fetch_add(1, Ordering::SeqCst) < 2 {
///             Err("not yet")
///         } else {
///             Ok("ready")
///         }
///     },
///     3,
/// );
///
/// task.execute_async();
/// assert_eq!(task.wait().unwrap(), "ready");
/// assert_eq!(task.attempts(), 3);
/// ```
pub struct AsyncTask<R> {
    inner: Arc<TaskInner<R>>,
}

impl<R> Clone for AsyncTask<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Clone + Send + Sync + 'static> AsyncTask<R> {
    /// Creates a task that runs `operation` under `ctx`.
    ///
    /// `retries` is a [`RetryPolicy`] or an `i32` where negative means unlimited.
    /// Nothing runs until [`AsyncTask::execute_async`] is called.
    pub fn new<F, E>(ctx: &Context, operation: F, retries: impl Into<RetryPolicy>) -> Self
    where
        F: Fn(&Context) -> Result<R, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        Self {
            inner: Arc::new(TaskInner {
                ctx: ctx.clone(),
                operation: Box::new(move |ctx: &Context| operation(ctx).map_err(Into::into)),
                policy: retries.into(),
                future: Future::with_context(ctx),
                done: RwLock::new(None),
                started: AtomicBool::new(false),
                attempts: AtomicU64::new(0),
            }),
        }
    }

    /// Starts the operation on a background worker thread.
    ///
    /// Only the first call starts a worker; later calls are ignored and return
    /// `false`. If the worker cannot be spawned the future is settled with
    /// [`TaskError::Spawn`].
    pub fn execute_async(&self) -> bool {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            warn!("execute_async called on a task that already started, ignoring");
            return false;
        }

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("tether-task".to_owned())
            .spawn(move || inner.run());

        if let Err(e) = spawned {
            warn!(error = %e, "failed to spawn task worker");
            self.inner.future.fail(TaskError::Spawn(Arc::new(e)));
        } else {
            debug!(policy = ?self.inner.policy, "task started");
        }
        true
    }

    /// Blocks until the task reaches a terminal state and returns its result.
    ///
    /// Once the task has settled, the result is cached and every later call
    /// returns it immediately. If the task's context stops first, the
    /// context's error is returned without being cached.
    pub fn wait(&self) -> Result<R, TaskError> {
        if let Some(done) = self.inner.done.read().as_ref() {
            return done.clone();
        }
        let observed = self.inner.future.wait();
        self.remember(observed)
    }

    /// Async counterpart of [`AsyncTask::wait`].
    pub async fn wait_async(&self) -> Result<R, TaskError> {
        if let Some(done) = self.cached() {
            return done;
        }
        let observed = self.inner.future.wait_async().await;
        self.remember(observed)
    }

    fn cached(&self) -> Option<Result<R, TaskError>> {
        self.inner.done.read().clone()
    }

    fn remember(&self, observed: Result<R, TaskError>) -> Result<R, TaskError> {
        // Cache what the future holds, so the cache can never disagree with it.
        match self.inner.future.try_get() {
            Some(settled) => self.inner.done.write().get_or_insert(settled).clone(),
            None => observed,
        }
    }
}

impl<R> AsyncTask<R> {
    /// Cancels the task, settling its future with [`TaskError::Cancelled`].
    ///
    /// A running attempt is not interrupted, but no further attempt starts and
    /// its result is discarded. Returns `false` if the task had already settled.
    pub fn cancel(&self) -> bool {
        let cancelled = self.inner.future.cancel();
        if cancelled {
            debug!("task cancelled");
        }
        cancelled
    }

    /// Returns the future the task's outcome is published to.
    pub fn future(&self) -> Future<R> {
        self.inner.future.clone()
    }

    /// Returns how many attempts have been started so far.
    pub fn attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::Relaxed)
    }

    /// Returns `true` once the task has settled.
    pub fn is_done(&self) -> bool {
        self.inner.future.is_settled()
    }

    /// Returns how failed attempts are retried.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.inner.policy
    }

    /// Returns the context the task runs under.
    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }
}

impl<R> fmt::Debug for AsyncTask<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncTask")
            .field("policy", &self.inner.policy)
            .field("attempts", &self.attempts())
            .field("future", &self.inner.future)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicU32;
    use std::time::{Duration, Instant};

    use crate::context::ContextError;

    fn counter() -> Arc<AtomicU32> {
        Arc::new(AtomicU32::new(0))
    }

    // ── RetryPolicy ───────────────────────────────────────────────────────────

    #[test]
    fn policy_from_i32() {
        assert_eq!(RetryPolicy::from(0), RetryPolicy::Limited(0));
        assert_eq!(RetryPolicy::from(5), RetryPolicy::Limited(5));
        assert_eq!(RetryPolicy::from(-1), RetryPolicy::Unlimited);
        assert_eq!(RetryPolicy::from(i32::MIN), RetryPolicy::Unlimited);
        assert_eq!(RetryPolicy::default(), RetryPolicy::Limited(0));
    }

    #[test]
    fn policy_deserializes_from_config() {
        let limited: RetryPolicy = serde_json::from_str(r#"{"limited":3}"#).unwrap();
        assert_eq!(limited, RetryPolicy::Limited(3));

        let unlimited: RetryPolicy = serde_json::from_str(r#""unlimited""#).unwrap();
        assert_eq!(unlimited, RetryPolicy::Unlimited);

        assert_eq!(
            serde_json::to_string(&RetryPolicy::Limited(2)).unwrap(),
            r#"{"limited":2}"#
        );
    }

    #[test]
    fn policy_permits_retry() {
        let policy = RetryPolicy::Limited(3);
        assert!(policy.permits_retry(0));
        assert!(policy.permits_retry(2));
        assert!(!policy.permits_retry(3));
        assert!(!RetryPolicy::Limited(0).permits_retry(0));
        assert!(RetryPolicy::Unlimited.permits_retry(u64::MAX));
    }

    // ── Retry loop ────────────────────────────────────────────────────────────

    #[test]
    fn retry_then_success() {
        let calls = counter();
        let task = {
            let calls = Arc::clone(&calls);
            AsyncTask::new(
                &Context::background(),
                move |_ctx: &Context| {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("failure")
                    } else {
                        Ok(42)
                    }
                },
                3,
            )
        };

        assert!(task.execute_async());
        assert_eq!(task.wait().unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(task.attempts(), 3);
    }

    #[test]
    fn exhausted_retries_report_last_attempt() {
        let calls = counter();
        let task = {
            let calls = Arc::clone(&calls);
            AsyncTask::new(
                &Context::background(),
                move |_ctx: &Context| -> Result<(), _> {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("failure")
                },
                3,
            )
        };

        task.execute_async();
        let err = task.wait().unwrap_err();

        assert_eq!(err.to_string(), "attempt 3 has failed: failure");
        assert!(matches!(err, TaskError::AttemptFailed { attempt: 3, .. }));
        assert!(!err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn zero_retries_runs_once() {
        let task = AsyncTask::new(
            &Context::background(),
            |_ctx: &Context| -> Result<u8, _> { Err(std::io::Error::other("disk full")) },
            0,
        );

        task.execute_async();
        assert_eq!(
            task.wait().unwrap_err().to_string(),
            "attempt 0 has failed: disk full"
        );
        assert_eq!(task.attempts(), 1);
    }

    #[test]
    fn unlimited_retries_until_success() {
        let calls = counter();
        let task = {
            let calls = Arc::clone(&calls);
            AsyncTask::new(
                &Context::background(),
                move |_ctx: &Context| {
                    if calls.fetch_add(1, Ordering::SeqCst) < 50 {
                        Err("again")
                    } else {
                        Ok("finally")
                    }
                },
                RetryPolicy::Unlimited,
            )
        };

        task.execute_async();
        assert_eq!(task.wait().unwrap(), "finally");
        assert_eq!(calls.load(Ordering::SeqCst), 51);
    }

    #[test]
    fn panic_counts_as_failed_attempt() {
        let task = AsyncTask::new(
            &Context::background(),
            |_ctx: &Context| -> Result<u8, BoxError> { panic!("kaboom") },
            1,
        );

        task.execute_async();
        assert_eq!(
            task.wait().unwrap_err().to_string(),
            "attempt 1 has failed: operation panicked: kaboom"
        );
        assert_eq!(task.attempts(), 2);
    }

    // ── Wait ──────────────────────────────────────────────────────────────────

    #[test]
    fn wait_is_cached_after_settlement() {
        let calls = counter();
        let task = {
            let calls = Arc::clone(&calls);
            AsyncTask::new(
                &Context::background(),
                move |_ctx: &Context| -> Result<_, BoxError> {
                    Ok(calls.fetch_add(1, Ordering::SeqCst))
                },
                0,
            )
        };

        task.execute_async();
        assert_eq!(task.wait().unwrap(), 0);
        assert_eq!(task.wait().unwrap(), 0);
        assert_eq!(task.future().try_get().unwrap().unwrap(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(task.is_done());
    }

    #[test]
    fn execute_async_starts_only_once() {
        let calls = counter();
        let task = {
            let calls = Arc::clone(&calls);
            AsyncTask::new(
                &Context::background(),
                move |_ctx: &Context| -> Result<(), BoxError> {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                0,
            )
        };

        assert!(task.execute_async());
        assert!(!task.execute_async());
        task.wait().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // ── Cancellation ──────────────────────────────────────────────────────────

    #[test]
    fn cancelled_context_prevents_first_attempt() {
        let (ctx, handle) = Context::with_cancel(&Context::background());
        handle.cancel();

        let calls = counter();
        let task = {
            let calls = Arc::clone(&calls);
            AsyncTask::new(
                &ctx,
                move |_ctx: &Context| -> Result<(), BoxError> {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                3,
            )
        };

        task.execute_async();
        let err = task.wait().unwrap_err();
        assert!(matches!(err, TaskError::Context(ContextError::Canceled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn context_cancel_during_attempt_does_not_consume_retry() {
        let (ctx, handle) = Context::with_cancel(&Context::background());
        let calls = counter();
        let task = {
            let calls = Arc::clone(&calls);
            AsyncTask::new(
                &ctx,
                move |_ctx: &Context| -> Result<(), _> {
                    calls.fetch_add(1, Ordering::SeqCst);
                    handle.cancel();
                    Err("failure")
                },
                5,
            )
        };

        task.execute_async();
        let err = task.wait().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "context canceled");

        // The worker settles the future with the same cancellation.
        assert!(task.future().wait().unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn explicit_cancel_stops_retrying() {
        let calls = counter();
        let task = {
            let calls = Arc::clone(&calls);
            AsyncTask::new(
                &Context::background(),
                move |_ctx: &Context| -> Result<(), _> {
                    calls.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(100));
                    Err("slow failure")
                },
                RetryPolicy::Unlimited,
            )
        };

        task.execute_async();
        std::thread::sleep(Duration::from_millis(30));

        let start = Instant::now();
        assert!(task.cancel());
        assert!(!task.cancel());
        assert!(matches!(task.wait().unwrap_err(), TaskError::Cancelled));
        assert!(start.elapsed() < Duration::from_millis(90));

        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn operation_sees_task_context() {
        let (ctx, _handle) =
            Context::with_timeout(&Context::background(), Duration::from_secs(60));
        let deadline = ctx.deadline();
        let task = AsyncTask::new(
            &ctx,
            |ctx: &Context| -> Result<_, BoxError> { Ok(ctx.deadline()) },
            0,
        );

        task.execute_async();
        assert_eq!(task.wait().unwrap(), deadline);
    }

    // ── Async ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn wait_async_returns_result() {
        let task = AsyncTask::new(
            &Context::background(),
            |_ctx: &Context| -> Result<_, BoxError> { Ok(String::from("async")) },
            0,
        );

        task.execute_async();
        assert_eq!(task.wait_async().await.unwrap(), "async");
        assert_eq!(task.wait().unwrap(), "async");
    }
}
