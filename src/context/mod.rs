//! Cancellation contexts — cooperative cancellation and deadlines.
//!
//! A [`Context`] is the signal every future and task in this crate observes to
//! learn that its caller has given up. Contexts form a tree: a child derived
//! with [`Context::with_cancel`] or [`Context::with_deadline`] is cancelled
//! whenever its parent is, and inherits the parent's deadline when that one is
//! earlier.
//!
//! Explicit cancellation is pushed: [`CancelHandle::cancel`] wakes every
//! blocked waiter and runs the registered cancellation hooks. Deadlines are
//! pulled: [`Context::err`] reports [`ContextError::DeadlineExceeded`] as soon
//! as the deadline has passed, and every blocking wait in this crate bounds its
//! sleep by the context's deadline, so no timer thread is needed.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use tether::context::{Context, ContextError};
//!
//! let (ctx, handle) = Context::with_cancel(&Context::background());
//! assert_eq!(ctx.err(), None);
//!
//! handle.cancel();
//! assert_eq!(ctx.err(), Some(ContextError::Canceled));
//!
//! let (ctx, _handle) = Context::with_timeout(&Context::background(), Duration::from_millis(10));
//! assert_eq!(ctx.wait(), ContextError::DeadlineExceeded);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::pin::pin;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

/// Why a [`Context`] stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

type Callback = Box<dyn FnOnce(ContextError) + Send>;

#[derive(Default)]
struct State {
    err: Option<ContextError>,
    callbacks: HashMap<u64, Callback>,
    next_id: u64,
    // Link to the parent's cancellation hook, dropped once this context is done.
    parent: Option<Registration>,
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
    notify: Notify,
    deadline: Option<Instant>,
}

impl Inner {
    fn new(deadline: Option<Instant>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
            notify: Notify::new(),
            deadline,
        }
    }

    fn deadline_passed(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    fn err(&self) -> Option<ContextError> {
        if let Some(err) = self.state.lock().err {
            return Some(err);
        }
        self.deadline_passed()
            .then_some(ContextError::DeadlineExceeded)
    }

    fn cancel(&self, err: ContextError) -> bool {
        if self.deadline_passed() {
            return false;
        }

        let (callbacks, parent) = {
            let mut state = self.state.lock();
            if state.err.is_some() {
                return false;
            }
            state.err = Some(err);
            (std::mem::take(&mut state.callbacks), state.parent.take())
        };
        drop(parent);

        debug!(cause = %err, hooks = callbacks.len(), "context cancelled");

        self.cond.notify_all();
        self.notify.notify_waiters();
        for (_, callback) in callbacks {
            callback(err);
        }
        true
    }
}

/// A cancellation signal shared by everything working on behalf of one caller.
///
/// `Context` is a cheap handle: clones observe the same signal. Only the
/// [`CancelHandle`] returned alongside a derived context can cancel it.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// Returns a root context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self {
            inner: Arc::new(Inner::new(None)),
        }
    }

    /// Derives a child context that is cancelled by the returned handle or by
    /// `parent`, whichever happens first.
    pub fn with_cancel(parent: &Context) -> (Context, CancelHandle) {
        Self::derive(parent, parent.deadline())
    }

    /// Derives a child context that additionally expires at `deadline`.
    ///
    /// If the parent's deadline is earlier, the child keeps the parent's.
    pub fn with_deadline(parent: &Context, deadline: Instant) -> (Context, CancelHandle) {
        let deadline = match parent.deadline() {
            Some(inherited) if inherited < deadline => inherited,
            _ => deadline,
        };
        Self::derive(parent, Some(deadline))
    }

    /// Derives a child context that expires `timeout` from now.
    ///
    /// A timeout too large to represent as an [`Instant`] sets no deadline of
    /// its own; the child then behaves like [`Context::with_cancel`].
    pub fn with_timeout(parent: &Context, timeout: Duration) -> (Context, CancelHandle) {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => Self::with_deadline(parent, deadline),
            None => Self::with_cancel(parent),
        }
    }

    fn derive(parent: &Context, deadline: Option<Instant>) -> (Context, CancelHandle) {
        let child = Context {
            inner: Arc::new(Inner::new(deadline)),
        };

        let weak = Arc::downgrade(&child.inner);
        let link = parent.on_cancel(move |err| {
            if let Some(inner) = weak.upgrade() {
                inner.cancel(err);
            }
        });

        {
            let mut state = child.inner.state.lock();
            if state.err.is_none() {
                state.parent = Some(link);
            }
        }

        let handle = CancelHandle {
            inner: Arc::clone(&child.inner),
        };
        (child, handle)
    }

    /// Returns why the context stopped, or `None` while it is still live.
    pub fn err(&self) -> Option<ContextError> {
        self.inner.err()
    }

    /// Returns `true` once the context has been cancelled or its deadline passed.
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Returns the instant at which this context expires, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Blocks the calling thread until the context stops.
    ///
    /// A background context never stops, so waiting on it blocks forever.
    pub fn wait(&self) -> ContextError {
        loop {
            if let Some(err) = self.block_until(None) {
                return err;
            }
        }
    }

    /// Blocks for at most `timeout`, returning `true` if the context stopped.
    ///
    /// A timeout too large to represent as an [`Instant`] waits like [`Context::wait`].
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match Instant::now().checked_add(timeout) {
            Some(until) => self.block_until(Some(until)).is_some(),
            None => {
                self.wait();
                true
            }
        }
    }

    fn block_until(&self, until: Option<Instant>) -> Option<ContextError> {
        let limit = earliest(until, self.inner.deadline);
        {
            let mut state = self.inner.state.lock();
            loop {
                if let Some(err) = state.err {
                    return Some(err);
                }
                match limit {
                    Some(limit) => {
                        if self.inner.cond.wait_until(&mut state, limit).timed_out() {
                            break;
                        }
                    }
                    None => self.inner.cond.wait(&mut state),
                }
            }
        }
        self.err()
    }

    /// Resolves once the context stops.
    ///
    /// Deadlines are honoured with [`tokio::time`], so this must be awaited
    /// inside a Tokio runtime with the time driver enabled.
    pub async fn done(&self) -> ContextError {
        loop {
            let mut notified = pin!(self.inner.notify.notified());
            notified.as_mut().enable();

            if let Some(err) = self.err() {
                return err;
            }

            match self.inner.deadline {
                Some(deadline) => {
                    let _ = tokio::time::timeout_at(deadline.into(), notified).await;
                }
                None => notified.await,
            }
        }
    }

    /// Runs `callback` once when this context is explicitly cancelled, either
    /// directly or through an ancestor.
    ///
    /// If the context has already stopped the callback runs immediately on the
    /// calling thread. Deadline expiry does not run callbacks; observers that
    /// care about the deadline bound their own waits by [`Context::deadline`].
    pub(crate) fn on_cancel<F>(&self, callback: F) -> Registration
    where
        F: FnOnce(ContextError) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if let Some(err) = state.err {
            drop(state);
            callback(err);
            return Registration::inert();
        }

        let id = state.next_id;
        state.next_id += 1;
        state.callbacks.insert(id, Box::new(callback));

        Registration {
            ctx: Arc::downgrade(&self.inner),
            id: Some(id),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("err", &self.err())
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

/// Cancels the [`Context`] it was created with.
///
/// Handles are cheap to clone; cancelling through any clone cancels the context.
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<Inner>,
}

impl CancelHandle {
    /// Cancels the context and all of its descendants.
    ///
    /// Returns `false` if the context had already stopped.
    pub fn cancel(&self) -> bool {
        self.inner.cancel(ContextError::Canceled)
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("err", &self.inner.err())
            .finish()
    }
}

/// Keeps a cancellation hook registered; dropping it removes the hook.
pub(crate) struct Registration {
    ctx: Weak<Inner>,
    id: Option<u64>,
}

impl Registration {
    fn inert() -> Self {
        Self {
            ctx: Weak::new(),
            id: None,
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let (Some(id), Some(inner)) = (self.id, self.ctx.upgrade()) else {
            return;
        };
        let removed = inner.state.lock().callbacks.remove(&id);
        drop(removed);
    }
}

/// Returns the earlier of two optional instants.
pub(crate) fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
