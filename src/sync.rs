use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Read/write lock guarding one node's state.
///
/// Capacity reads go through [`NodeLock::read_fast`], which attempts a
/// non-blocking shared acquisition and only falls back to a full read lock
/// when a writer currently holds the state. Mutation always takes the
/// exclusive lock, held for exactly one refill/simulate/commit critical
/// section per call.
///
/// The lock is not re-entrant. Consume paths acquire strictly top-down
/// (composite before child); upward propagation and waiter wakeups run only
/// after the mutating node's own lock has been released.
pub(crate) struct NodeLock<T> {
    inner: RwLock<T>,
}

impl<T> NodeLock<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(value),
        }
    }

    /// Optimistic read: try without blocking, take the slow path only when
    /// a concurrent writer invalidates the attempt.
    pub(crate) fn read_fast(&self) -> RwLockReadGuard<'_, T> {
        self.inner
            .try_read()
            .unwrap_or_else(|| self.inner.read())
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.inner.write()
    }
}

/// Condition channel layered beside [`NodeLock`], which has no native
/// wait/notify support.
///
/// Waiters snapshot the generation counter before their consumption
/// attempt; [`Signal::wait_past`] returns immediately if any notification
/// happened after that snapshot. This closes the window between a failed
/// attempt and the wait that follows it, so a wakeup can never be lost.
pub struct Signal {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Signal {
    pub(crate) fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    pub(crate) fn notify_all(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Blocks until a notification newer than `seen` arrives or `timeout`
    /// elapses. Returns `true` if woken by a notification. Spurious wakeups
    /// are absorbed here; the caller still re-checks its own predicate.
    pub(crate) fn wait_past(&self, seen: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut generation = self.generation.lock();
        while *generation == seen {
            if self.cond.wait_until(&mut generation, deadline).timed_out() {
                return *generation != seen;
            }
        }
        true
    }
}

/// Cooperative cancellation handle for blocking consumption.
///
/// Cloning the token shares the underlying state: cancelling any clone wakes
/// every consumer currently blocked with it, and those calls return
/// [`Error::Cancelled`](crate::Error::Cancelled).
///
/// # Examples
///
/// ```rust
/// use tollgate::CancelToken;
///
/// let token = CancelToken::new();
/// let handle = token.clone();
/// assert!(!token.is_cancelled());
/// handle.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    // signals of nodes with a waiter currently blocked under this token
    waiters: Mutex<Vec<Arc<Signal>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Marks the token cancelled and wakes every registered waiter.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        for signal in self.inner.waiters.lock().drain(..) {
            signal.notify_all();
        }
    }

    pub(crate) fn register(&self, signal: &Arc<Signal>) {
        self.inner.waiters.lock().push(Arc::clone(signal));
    }

    pub(crate) fn unregister(&self, signal: &Arc<Signal>) {
        let mut waiters = self.inner.waiters.lock();
        if let Some(pos) = waiters.iter().position(|s| Arc::ptr_eq(s, signal)) {
            waiters.swap_remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_wakes_past_generation() {
        let signal = Arc::new(Signal::new());
        let seen = signal.generation();
        // a notification between snapshot and wait is not lost
        signal.notify_all();
        assert!(signal.wait_past(seen, Duration::from_millis(10)));
    }

    #[test]
    fn signal_times_out_without_notification() {
        let signal = Signal::new();
        let seen = signal.generation();
        assert!(!signal.wait_past(seen, Duration::from_millis(10)));
    }

    #[test]
    fn signal_wakes_blocked_thread() {
        let signal = Arc::new(Signal::new());
        let seen = signal.generation();
        let woken = std::thread::scope(|s| {
            let waiter = {
                let signal = Arc::clone(&signal);
                s.spawn(move || signal.wait_past(seen, Duration::from_secs(5)))
            };
            std::thread::sleep(Duration::from_millis(20));
            signal.notify_all();
            waiter.join().unwrap()
        });
        assert!(woken);
    }

    #[test]
    fn cancel_token_wakes_registered_signal() {
        let token = CancelToken::new();
        let signal = Arc::new(Signal::new());
        token.register(&signal);
        let seen = signal.generation();
        token.cancel();
        assert!(token.is_cancelled());
        assert!(signal.wait_past(seen, Duration::from_millis(10)));
    }

    #[test]
    fn unregister_removes_waiter() {
        let token = CancelToken::new();
        let signal = Arc::new(Signal::new());
        token.register(&signal);
        token.unregister(&signal);
        let seen = signal.generation();
        token.cancel();
        // not registered anymore, so no notification was sent
        assert!(!signal.wait_past(seen, Duration::from_millis(10)));
    }

    #[test]
    fn read_fast_falls_back_under_writer() {
        let lock = Arc::new(NodeLock::new(7u32));
        std::thread::scope(|s| {
            let guard = lock.write();
            let reader = {
                let lock = Arc::clone(&lock);
                s.spawn(move || *lock.read_fast())
            };
            std::thread::sleep(Duration::from_millis(20));
            drop(guard);
            assert_eq!(reader.join().unwrap(), 7);
        });
    }
}
