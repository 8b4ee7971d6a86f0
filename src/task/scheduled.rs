//! Tasks that start at a given instant.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{AsyncTask, RetryPolicy};
use crate::context::Context;
use crate::future::{BoxError, Future, TaskError};

/// An [`AsyncTask`] whose execution is deferred until `start_at`.
///
/// [`ScheduledTask::schedule`] arms a timer thread and hands back the task's
/// future straight away. When the timer fires the task runs exactly as if
/// [`AsyncTask::execute_async`] had been called. Cancelling before that point
/// settles the future with [`TaskError::Cancelled`] and the operation never runs.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tether::context::Context;
/// use tether::future::BoxError;
/// use tether::task::ScheduledTask;
///
/// let task = ScheduledTask::after(
///     &Context::background(),
///     Duration::from_millis(20),
///     |_ctx: &Context| -> Result<_, BoxError> { Ok("tick") },
///     0,
/// );
///
/// let future = task.schedule().expect("first schedule arms the timer");
/// assert!(task.schedule().is_none());
/// assert_eq!(future.wait().unwrap(), "tick");
/// ```
pub struct ScheduledTask<R> {
    task: AsyncTask<R>,
    start_at: Instant,
    started: Mutex<bool>,
}

impl<R: Clone + Send + Sync + 'static> ScheduledTask<R> {
    /// Creates a task that runs `operation` under `ctx` once `start_at` is reached.
    pub fn new<F, E>(
        ctx: &Context,
        start_at: Instant,
        operation: F,
        retries: impl Into<RetryPolicy>,
    ) -> Self
    where
        F: Fn(&Context) -> Result<R, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        Self::from_task(AsyncTask::new(ctx, operation, retries), start_at)
    }

    /// Creates a task that runs `operation` `delay` from now.
    ///
    /// A delay too large to represent as an [`Instant`] is clamped to roughly
    /// thirty years, which in practice never fires unless cancelled.
    pub fn after<F, E>(
        ctx: &Context,
        delay: Duration,
        operation: F,
        retries: impl Into<RetryPolicy>,
    ) -> Self
    where
        F: Fn(&Context) -> Result<R, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        Self::new(ctx, start_after(delay), operation, retries)
    }

    /// Wraps an existing task so that it starts at `start_at`.
    pub fn from_task(task: AsyncTask<R>, start_at: Instant) -> Self {
        Self {
            task,
            start_at,
            started: Mutex::new(false),
        }
    }

    /// Arms the timer and returns the task's future.
    ///
    /// Only the first call arms a timer; later calls return `None`. A start
    /// time in the past fires immediately.
    pub fn schedule(&self) -> Option<Future<R>> {
        let mut started = self.started.lock();
        if *started {
            debug!("task already scheduled");
            return None;
        }
        *started = true;

        let task = self.task.clone();
        let start_at = self.start_at;
        let spawned = thread::Builder::new()
            .name("tether-timer".to_owned())
            .spawn(move || fire_at(task, start_at));

        match spawned {
            Ok(_) => {
                let delay = start_at.saturating_duration_since(Instant::now());
                debug!(?delay, "task scheduled");
            }
            Err(e) => {
                warn!(error = %e, "failed to spawn timer thread");
                self.task.future().fail(TaskError::Spawn(Arc::new(e)));
            }
        }

        Some(self.task.future())
    }

    /// Returns `true` once [`ScheduledTask::schedule`] has been called.
    pub fn is_scheduled(&self) -> bool {
        *self.started.lock()
    }
}

impl<R> ScheduledTask<R> {
    /// Cancels the scheduled task.
    ///
    /// Before [`ScheduledTask::schedule`] there is nothing armed and this is a
    /// no-op. Between scheduling and firing, the future is settled with
    /// [`TaskError::Cancelled`] and the operation never runs. After firing it
    /// behaves like [`AsyncTask::cancel`]. Returns `true` if the call settled
    /// the future.
    pub fn cancel(&self) -> bool {
        let started = self.started.lock();
        if !*started {
            debug!("cancel before schedule, nothing armed");
            return false;
        }
        self.task.cancel()
    }

    /// Returns the instant the timer fires at.
    pub fn start_at(&self) -> Instant {
        self.start_at
    }

    /// Returns the wrapped task.
    pub fn task(&self) -> &AsyncTask<R> {
        &self.task
    }
}

// Far enough ahead to never fire, close enough to stay representable.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn start_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

// Body of the timer thread: sleep on the task's future until `start_at`, then
// hand over to the task's own worker unless something settled it first.
fn fire_at<R: Clone + Send + Sync + 'static>(task: AsyncTask<R>, start_at: Instant) {
    let future = task.future();
    match future.wait_until(Some(start_at)) {
        None => {
            debug!("timer fired");
            task.execute_async();
        }
        Some(Ok(_)) => debug!("task completed before timer fired"),
        Some(Err(err)) => {
            // A stopped context releases the wait without settling the future.
            future.fail(err.clone());
            debug!(error = %err, "task stopped before timer fired");
        }
    }
}

impl<R> fmt::Debug for ScheduledTask<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("start_at", &self.start_at)
            .field("scheduled", &*self.started.lock())
            .field("task", &self.task)
            .finish()
    }
}
