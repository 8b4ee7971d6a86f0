//! Lock-free unbounded MPMC queue.
//!
//! [`LockFreeQueue`] implements the algorithm from *Simple, Fast, and Practical
//! Non-Blocking and Blocking Concurrent Queue Algorithms* (Michael & Scott, 1996):
//! a singly linked list with a dummy node at the head, where producers CAS new
//! nodes onto `tail.next` and consumers CAS `head` forward.
//!
//! ## Memory reclamation
//!
//! A consumer that swings `head` forward cannot free the old dummy node right
//! away: another thread may have loaded the same `head` and still be about to
//! read `head.next`. Nodes are therefore retired through [`crossbeam_epoch`],
//! which frees them only once every thread that could still hold a reference
//! has unpinned. Because a node is never reused while a reader can see it, the
//! ABA problem that a plain pointer CAS would have cannot occur.
//!
//! ## Blocking
//!
//! [`LockFreeQueue::poll`] parks on a zero-capacity channel. Every enqueue
//! attempts a non-blocking send on it, which only succeeds if a poller is
//! parked at that moment; otherwise the hint is dropped. A poller that misses
//! a hint sleeps until its timeout and then re-checks the queue, so a missed
//! hint delays a poller but never loses an element.

use std::fmt;
use std::mem::MaybeUninit;
use std::pin::pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;
use tokio::sync::Notify;
use tracing::trace;

// Re-check interval for a poll with no representable deadline.
const UNBOUNDED_RECHECK: Duration = Duration::from_millis(100);

struct Node<T> {
    // Uninitialized for the dummy node, and moved out once the node becomes the dummy.
    value: MaybeUninit<T>,
    next: Atomic<Node<T>>,
}

impl<T> Node<T> {
    fn dummy() -> Self {
        Self {
            value: MaybeUninit::uninit(),
            next: Atomic::null(),
        }
    }

    fn new(value: T) -> Self {
        Self {
            value: MaybeUninit::new(value),
            next: Atomic::null(),
        }
    }
}

/// A *lock-free* multi-producer multi-consumer unbounded FIFO queue.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tether::queue::LockFreeQueue;
///
/// let queue = LockFreeQueue::new();
/// queue.enqueue(1);
/// queue.enqueue(2);
///
/// assert_eq!(queue.len(), 2);
/// assert_eq!(queue.try_dequeue(), Some(1));
/// assert_eq!(queue.poll(Duration::from_millis(10)), Some(2));
/// assert_eq!(queue.poll(Duration::from_millis(10)), None);
/// ```
pub struct LockFreeQueue<T> {
    head: CachePadded<Atomic<Node<T>>>,
    tail: CachePadded<Atomic<Node<T>>>,
    len: AtomicUsize,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    notify: Notify,
}

// SAFETY: values are moved in by `enqueue` and moved out exactly once by the
// consumer that wins the head CAS, so sharing the queue only ever transfers `T`
// between threads.
unsafe impl<T: Send> Send for LockFreeQueue<T> {}
unsafe impl<T: Send> Sync for LockFreeQueue<T> {}

impl<T> LockFreeQueue<T> {
    /// Creates an empty queue holding only the dummy node.
    pub fn new() -> Self {
        // SAFETY: the dummy is not reachable by any other thread yet.
        let dummy = Owned::new(Node::dummy()).into_shared(unsafe { epoch::unprotected() });
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(0);

        Self {
            head: CachePadded::new(Atomic::from(dummy)),
            tail: CachePadded::new(Atomic::from(dummy)),
            len: AtomicUsize::new(0),
            wake_tx,
            wake_rx,
            notify: Notify::new(),
        }
    }

    /// Appends `value` to the back of the queue.
    ///
    /// Never blocks: contention only costs extra CAS rounds. Afterwards a
    /// wake-up hint is offered to parked pollers.
    pub fn enqueue(&self, value: T) {
        let guard = &epoch::pin();
        let mut node = Owned::new(Node::new(value));

        // Counted before it is linked, so a consumer's decrement never
        // precedes the matching increment.
        self.len.fetch_add(1, Ordering::Relaxed);

        loop {
            let tail = self.tail.load(Ordering::Acquire, guard);
            // SAFETY: head and tail are never null and nodes reachable from them
            // are only freed after the current epoch guard is released.
            let tail_ref = unsafe { tail.deref() };
            let next = tail_ref.next.load(Ordering::Acquire, guard);

            // Tail is falling behind; help the producer that linked `next`.
            if !next.is_null() {
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed, guard);
                continue;
            }

            // Try to link the node at the end of the list.
            match tail_ref.next.compare_exchange(
                Shared::null(),
                node,
                Ordering::Release,
                Ordering::Relaxed,
                guard,
            ) {
                Ok(linked) => {
                    // Swing tail to the new node. Losing this race is fine: whoever
                    // observes the lag advances it.
                    let _ = self.tail.compare_exchange(
                        tail,
                        linked,
                        Ordering::Release,
                        Ordering::Relaxed,
                        guard,
                    );
                    break;
                }
                Err(err) => node = err.new,
            }
        }

        if self.wake_tx.try_send(()).is_ok() {
            trace!("woke a parked poller");
        }
        self.notify.notify_waiters();
    }

    /// Removes and returns the oldest element, or `None` if the queue is
    /// observed empty.
    pub fn try_dequeue(&self) -> Option<T> {
        let guard = &epoch::pin();
        let value = self.dequeue_with(guard);
        if value.is_some() {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        value
    }

    fn dequeue_with(&self, guard: &Guard) -> Option<T> {
        loop {
            let head = self.head.load(Ordering::Acquire, guard);
            let tail = self.tail.load(Ordering::Acquire, guard);
            // SAFETY: see `enqueue`.
            let next = unsafe { head.deref() }.next.load(Ordering::Acquire, guard);

            // SAFETY: a non-null `next` was linked by a producer and stays
            // allocated while `guard` is pinned.
            let next_ref = unsafe { next.as_ref() }?;

            if head == tail {
                // Tail is falling behind; advance it before moving head past it.
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed, guard);
                continue;
            }

            if self
                .head
                .compare_exchange(head, next, Ordering::Release, Ordering::Relaxed, guard)
                .is_ok()
            {
                // SAFETY: winning the CAS makes this thread the only one that
                // reads `next.value`; the node is the new dummy from here on and
                // its value is never touched again. The old dummy is unreachable
                // from the queue and is freed once all current readers unpin.
                unsafe {
                    guard.defer_destroy(head);
                    return Some(next_ref.value.assume_init_read());
                }
            }
        }
    }

    /// Removes the oldest element, waiting up to `timeout` for one to arrive.
    ///
    /// Wakes early when a producer's hint reaches this poller. The queue is
    /// always re-checked after a wake or a timeout; the hint alone is never
    /// taken as proof that an element is available.
    pub fn poll(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if let Some(value) = self.try_dequeue() {
                return Some(value);
            }

            // A timeout too large to represent waits without a deadline, in
            // slices so that a missed hint is still picked up.
            let wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return None;
                    }
                    remaining
                }
                None => UNBOUNDED_RECHECK,
            };

            match self.wake_rx.recv_timeout(wait) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return self.try_dequeue(),
            }
        }
    }

    /// Async counterpart of [`LockFreeQueue::poll`].
    ///
    /// The wake-up is registered before the queue is re-checked, so a
    /// concurrent enqueue is never missed. Must be awaited inside a Tokio
    /// runtime with the time driver enabled.
    pub async fn poll_async(&self, timeout: Duration) -> Option<T> {
        let deadline = tokio::time::Instant::now().checked_add(timeout);
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            if let Some(value) = self.try_dequeue() {
                return Some(value);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.try_dequeue();
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Returns the number of elements in the queue.
    ///
    /// The count is maintained next to, not atomically with, the list itself:
    /// under concurrent use it may briefly count an element that is not yet
    /// linked, but it never goes below zero and converges once operations
    /// complete.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Returns `true` if the queue is observed empty.
    pub fn is_empty(&self) -> bool {
        let guard = &epoch::pin();
        let head = self.head.load(Ordering::Acquire, guard);
        // SAFETY: see `enqueue`.
        unsafe { head.deref() }
            .next
            .load(Ordering::Acquire, guard)
            .is_null()
    }
}

impl<T> Default for LockFreeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for LockFreeQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockFreeQueue")
            .field("len", &self.len())
            .finish()
    }
}

impl<T> Drop for LockFreeQueue<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` guarantees no other thread can reach the nodes,
        // so retired nodes may be destroyed immediately.
        unsafe {
            let guard = epoch::unprotected();
            while self.dequeue_with(guard).is_some() {}

            let dummy = self.head.load(Ordering::Relaxed, guard);
            drop(dummy.into_owned());
        }
    }
}
