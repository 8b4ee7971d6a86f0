//! Single-assignment futures — a result cell settled once and observed by many.
//!
//! A [`Future`] starts pending and is settled exactly once by [`Future::complete`],
//! [`Future::fail`] or [`Future::cancel`]. The first settlement wins; later calls
//! return `false` and their payload is dropped. Any number of threads may block in
//! [`Future::wait`] (or await [`Future::wait_async`]) and all of them observe the
//! same terminal result.
//!
//! Each future is bound to a [`Context`]. When that context stops before the
//! future settles, waiters are released with the context's error while the
//! future itself stays pending, so a producer may still settle it later for
//! anyone who waits on a different clone with a live context.

use std::fmt;
use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tokio::sync::Notify;

use crate::context::{Context, ContextError, Registration, earliest};

/// Error type accepted from user operations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Cloneable error stored in a settled [`Future`].
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Terminal failure of a [`Future`] or task.
///
/// Cancellation is kept apart from ordinary failure so callers can branch on
/// it with [`TaskError::is_cancelled`].
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The future or task was cancelled explicitly.
    #[error("task cancelled")]
    Cancelled,

    /// The surrounding context was cancelled or its deadline passed.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// The retry budget ran out; `attempt` is the zero-based number of the last attempt.
    #[error("attempt {attempt} has failed: {source}")]
    AttemptFailed {
        attempt: u64,
        #[source]
        source: SharedError,
    },

    /// A failure supplied directly to [`Future::fail`].
    #[error(transparent)]
    Failed(SharedError),

    /// The background worker thread could not be started.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] Arc<std::io::Error>),
}

impl TaskError {
    /// Wraps an arbitrary error as [`TaskError::Failed`].
    pub fn failed(err: impl Into<BoxError>) -> Self {
        Self::Failed(Arc::from(err.into()))
    }

    /// Returns `true` for explicit cancellation and for context cancellation or expiry.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Context(_))
    }
}

struct Shared<T> {
    state: Mutex<Option<Result<T, TaskError>>>,
    cond: Condvar,
    notify: Notify,
    ctx: Context,
    // Rebroadcasts context cancellation to this future's waiters.
    _watcher: Registration,
}

impl<T> Shared<T> {
    fn broadcast(&self) {
        {
            let _state = self.state.lock();
            self.cond.notify_all();
        }
        self.notify.notify_waiters();
    }
}

/// A single-assignment result cell shared between one producer and many waiters.
///
/// `Future` is a cheap handle; every clone refers to the same cell.
///
/// # Examples
///
/// ```
/// use std::thread;
/// use tether::future::Future;
///
/// let future = Future::new();
/// let producer = future.clone();
///
/// thread::spawn(move || {
///     producer.complete(42);
/// });
///
/// assert_eq!(future.wait().unwrap(), 42);
/// assert!(!future.complete(7), "already settled");
/// ```
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> Future<T> {
    /// Creates a pending future bound to a background context.
    pub fn new() -> Self {
        Self::with_context(&Context::background())
    }

    /// Creates a pending future whose waiters also give up when `ctx` stops.
    pub fn with_context(ctx: &Context) -> Self {
        let shared = Arc::new_cyclic(|weak: &std::sync::Weak<Shared<T>>| {
            let weak = weak.clone();
            let watcher = ctx.on_cancel(move |_| {
                if let Some(shared) = weak.upgrade() {
                    shared.broadcast();
                }
            });
            Shared {
                state: Mutex::new(None),
                cond: Condvar::new(),
                notify: Notify::new(),
                ctx: ctx.clone(),
                _watcher: watcher,
            }
        });
        Self { shared }
    }
}

impl<T: Send + 'static> Default for Future<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Future<T> {
    /// Settles the future with `value`.
    ///
    /// Returns `false`, dropping `value`, if the future was already settled.
    pub fn complete(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Settles the future with `err`.
    ///
    /// Returns `false` if the future was already settled.
    pub fn fail(&self, err: TaskError) -> bool {
        self.settle(Err(err))
    }

    /// Settles the future with [`TaskError::Cancelled`].
    pub fn cancel(&self) -> bool {
        self.fail(TaskError::Cancelled)
    }

    fn settle(&self, result: Result<T, TaskError>) -> bool {
        {
            let mut state = self.shared.state.lock();
            if state.is_some() {
                return false;
            }
            *state = Some(result);
            self.shared.cond.notify_all();
        }
        self.shared.notify.notify_waiters();
        true
    }

    /// Returns `true` once the future holds a result.
    pub fn is_settled(&self) -> bool {
        self.shared.state.lock().is_some()
    }

    /// Returns the context this future's waiters observe.
    pub fn context(&self) -> &Context {
        &self.shared.ctx
    }
}

impl<T: Clone> Future<T> {
    /// Returns the settled result without blocking, or `None` while pending.
    pub fn try_get(&self) -> Option<Result<T, TaskError>> {
        self.shared.state.lock().clone()
    }

    /// Blocks until the future settles or its context stops.
    ///
    /// When the context stops first, its error is returned as
    /// [`TaskError::Context`] and the future is left untouched.
    pub fn wait(&self) -> Result<T, TaskError> {
        loop {
            if let Some(result) = self.wait_until(None) {
                return result;
            }
        }
    }

    /// Like [`Future::wait`], but gives up after `timeout` and returns `None`.
    ///
    /// A timeout too large to represent as an [`Instant`] waits like [`Future::wait`].
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, TaskError>> {
        match Instant::now().checked_add(timeout) {
            Some(until) => self.wait_until(Some(until)),
            None => Some(self.wait()),
        }
    }

    pub(crate) fn wait_until(&self, until: Option<Instant>) -> Option<Result<T, TaskError>> {
        let ctx = &self.shared.ctx;
        let limit = earliest(until, ctx.deadline());

        let mut state = self.shared.state.lock();
        loop {
            if let Some(result) = state.as_ref() {
                return Some(result.clone());
            }
            if let Some(err) = ctx.err() {
                return Some(Err(err.into()));
            }

            match limit {
                Some(limit) => {
                    if self.shared.cond.wait_until(&mut state, limit).timed_out() {
                        return match state.as_ref() {
                            Some(result) => Some(result.clone()),
                            None => ctx.err().map(|err| Err(err.into())),
                        };
                    }
                }
                None => self.shared.cond.wait(&mut state),
            }
        }
    }

    /// Async counterpart of [`Future::wait`].
    ///
    /// Context deadlines are honoured with [`tokio::time`], so this must be
    /// awaited inside a Tokio runtime with the time driver enabled.
    pub async fn wait_async(&self) -> Result<T, TaskError> {
        let ctx = &self.shared.ctx;
        loop {
            let mut notified = pin!(self.shared.notify.notified());
            notified.as_mut().enable();

            if let Some(result) = self.try_get() {
                return result;
            }
            if let Some(err) = ctx.err() {
                return Err(err.into());
            }

            match ctx.deadline() {
                Some(deadline) => {
                    let _ = tokio::time::timeout_at(deadline.into(), notified).await;
                }
                None => notified.await,
            }
        }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.shared.state.lock().as_ref() {
            None => "pending",
            Some(Ok(_)) => "completed",
            Some(Err(err)) if err.is_cancelled() => "cancelled",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("Future").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Barrier;
    use std::thread;

    use crate::context::CancelHandle;

    fn cancellable() -> (Context, CancelHandle) {
        Context::with_cancel(&Context::background())
    }

    // ── Settlement ────────────────────────────────────────────────────────────

    #[test]
    fn complete_then_wait() {
        let future = Future::new();
        assert!(!future.is_settled());
        assert!(future.try_get().is_none());

        assert!(future.complete("done"));
        assert!(future.is_settled());
        assert_eq!(future.wait().unwrap(), "done");
    }

    #[test]
    fn first_settlement_wins() {
        let future = Future::new();
        assert!(future.fail(TaskError::failed("boom")));
        assert!(!future.complete(1));
        assert!(!future.cancel());

        let err = future.wait().unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert!(!err.is_cancelled());
    }

    #[test]
    fn cancel_settles_with_cancelled() {
        let future = Future::<u8>::new();
        assert!(future.cancel());

        let err = future.wait().unwrap_err();
        assert!(matches!(err, TaskError::Cancelled));
        assert!(err.is_cancelled());
        assert_eq!(format!("{future:?}"), r#"Future { state: "cancelled" }"#);
    }

    #[test]
    fn complete_and_fail_race_has_one_winner() {
        for _ in 0..200 {
            let future = Future::new();
            let barrier = Arc::new(Barrier::new(2));

            let completer = {
                let (future, barrier) = (future.clone(), Arc::clone(&barrier));
                thread::spawn(move || {
                    barrier.wait();
                    future.complete(1)
                })
            };
            let failer = {
                let (future, barrier) = (future.clone(), Arc::clone(&barrier));
                thread::spawn(move || {
                    barrier.wait();
                    future.fail(TaskError::failed("lost"))
                })
            };

            let completed = completer.join().unwrap();
            let failed = failer.join().unwrap();
            assert!(completed ^ failed, "exactly one settlement must win");

            let first = future.wait();
            assert_eq!(first.is_ok(), completed);
            for _ in 0..3 {
                assert_eq!(future.wait().is_ok(), completed);
            }
        }
    }

    // ── Waiting ───────────────────────────────────────────────────────────────

    #[test]
    fn many_waiters_observe_same_value() {
        let future = Future::new();
        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let future = future.clone();
                thread::spawn(move || future.wait().unwrap())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        future.complete(String::from("shared"));

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), "shared");
        }
    }

    #[test]
    fn cancel_releases_waiter_before_late_complete() {
        let future = Future::new();
        let producer = {
            let future = future.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_secs(3));
                future.complete(10)
            })
        };

        let canceller = future.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });

        let start = Instant::now();
        let err = future.wait().unwrap_err();
        assert!(err.is_cancelled());
        assert!(start.elapsed() < Duration::from_secs(2));

        assert!(!producer.join().unwrap(), "late complete has no effect");
        assert!(future.wait().unwrap_err().is_cancelled());
    }

    #[test]
    fn wait_timeout_returns_none_while_pending() {
        let future = Future::<u8>::new();
        let start = Instant::now();
        assert!(future.wait_timeout(Duration::from_millis(30)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn wait_timeout_accepts_unrepresentable_timeout() {
        let future = Future::new();
        future.complete(1u8);
        assert_eq!(future.wait_timeout(Duration::MAX).unwrap().unwrap(), 1);

        let pending = Future::new();
        let producer = {
            let pending = pending.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                pending.complete(2u8)
            })
        };
        assert_eq!(pending.wait_timeout(Duration::MAX).unwrap().unwrap(), 2);
        assert!(producer.join().unwrap());
    }

    // ── Context ───────────────────────────────────────────────────────────────

    #[test]
    fn context_cancel_releases_waiter_without_settling() {
        let (ctx, handle) = cancellable();
        let future = Future::<u8>::with_context(&ctx);

        let waiter = {
            let future = future.clone();
            thread::spawn(move || future.wait())
        };
        thread::sleep(Duration::from_millis(30));
        handle.cancel();

        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, TaskError::Context(ContextError::Canceled)));
        assert_eq!(err.to_string(), "context canceled");
        assert!(!future.is_settled());

        assert!(future.complete(5));
        assert_eq!(future.try_get().unwrap().unwrap(), 5);
    }

    #[test]
    fn context_deadline_releases_waiter() {
        let (ctx, _handle) =
            Context::with_timeout(&Context::background(), Duration::from_millis(30));
        let future = Future::<u8>::with_context(&ctx);

        let err = future.wait().unwrap_err();
        assert!(matches!(err, TaskError::Context(ContextError::DeadlineExceeded)));
    }

    #[test]
    fn settled_value_wins_over_stopped_context() {
        let (ctx, handle) = cancellable();
        let future = Future::with_context(&ctx);
        future.complete(3);
        handle.cancel();

        assert_eq!(future.wait().unwrap(), 3);
    }

    // ── Errors ────────────────────────────────────────────────────────────────

    #[test]
    fn attempt_failed_message() {
        let err = TaskError::AttemptFailed {
            attempt: 3,
            source: Arc::from(BoxError::from("failure")),
        };
        assert_eq!(err.to_string(), "attempt 3 has failed: failure");
        assert!(std::error::Error::source(&err).is_some());
    }

    // ── Async ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn wait_async_sees_completion() {
        let future = Future::new();
        let producer = future.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.complete(9u32);
        });
        assert_eq!(future.wait_async().await.unwrap(), 9);
    }

    #[tokio::test]
    async fn wait_async_sees_context_cancel() {
        let (ctx, handle) = cancellable();
        let future = Future::<u32>::with_context(&ctx);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
        });
        assert!(future.wait_async().await.unwrap_err().is_cancelled());
    }
}
