//! [`TimedLock`] – mutex with a bounded wait and a fixed acquisition rank.
//!
//! Every kernel table sits behind a `TimedLock`.  Acquisition gives up after
//! the configured timeout and reports [`KernelError::LockTimeout`] instead of
//! blocking the caller indefinitely.
//!
//! # Lock ranks
//!
//! The kernel uses two levels of locking: the system lock owned by the
//! [`Kernel`][crate::Kernel] facade, and one private lock per component.  A
//! thread may only acquire a lock whose [`LockRank`] is strictly greater
//! than every rank it already holds, so the system lock always comes first.
//! Debug builds track held ranks per thread and panic on an out-of-order
//! acquisition; release builds skip the bookkeeping.

use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use espos_types::KernelError;
use parking_lot::{Mutex, MutexGuard};
use tracing::warn;

/// Position of a lock in the global acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockRank {
    /// The facade's outer lock.  Taken first.
    System,
    /// A component's private table lock.  Taken last.
    Component,
}

thread_local! {
    static HELD_RANKS: RefCell<Vec<LockRank>> = const { RefCell::new(Vec::new()) };
}

fn enter_rank(name: &str, rank: LockRank) {
    if !cfg!(debug_assertions) {
        return;
    }
    HELD_RANKS.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(&top) = held.iter().max()
            && top >= rank
        {
            panic!("lock order violation: acquiring '{name}' ({rank:?}) while holding a {top:?} lock");
        }
        held.push(rank);
    });
}

fn exit_rank(rank: LockRank) {
    if !cfg!(debug_assertions) {
        return;
    }
    HELD_RANKS.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(pos) = held.iter().rposition(|&r| r == rank) {
            held.remove(pos);
        }
    });
}

/// A named, ranked mutex with a bounded wait.
pub struct TimedLock<T> {
    name: &'static str,
    rank: LockRank,
    timeout: Duration,
    inner: Mutex<T>,
}

impl<T> TimedLock<T> {
    pub fn new(name: &'static str, rank: LockRank, timeout: Duration, value: T) -> Self {
        Self {
            name,
            rank,
            timeout,
            inner: Mutex::new(value),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquire the lock, waiting at most the configured timeout.
    ///
    /// # Errors
    ///
    /// [`KernelError::LockTimeout`] when the lock is still held by another
    /// thread after the timeout.
    ///
    /// # Panics
    ///
    /// In debug builds, when the calling thread already holds a lock of equal
    /// or higher rank.
    pub fn lock(&self) -> Result<TimedGuard<'_, T>, KernelError> {
        enter_rank(self.name, self.rank);
        match self.inner.try_lock_for(self.timeout) {
            Some(guard) => Ok(TimedGuard {
                guard,
                rank: self.rank,
            }),
            None => {
                exit_rank(self.rank);
                warn!(lock = self.name, timeout_ms = self.timeout.as_millis() as u64, "lock acquisition timed out");
                Err(KernelError::LockTimeout(self.name.to_string()))
            }
        }
    }
}

/// RAII guard returned by [`TimedLock::lock`].
pub struct TimedGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    rank: LockRank,
}

impl<T> Deref for TimedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for TimedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for TimedGuard<'_, T> {
    fn drop(&mut self) {
        exit_rank(self.rank);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn lock_and_mutate() {
        let lock = TimedLock::new("counter", LockRank::Component, Duration::from_millis(50), 0u32);
        *lock.lock().unwrap() += 5;
        assert_eq!(*lock.lock().unwrap(), 5);
    }

    #[test]
    fn contended_lock_times_out() {
        let lock = Arc::new(TimedLock::new(
            "busy",
            LockRank::Component,
            Duration::from_millis(20),
            (),
        ));
        let (held_tx, held_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let holder = {
            let lock = lock.clone();
            thread::spawn(move || {
                let _guard = lock.lock().unwrap();
                held_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
        };
        held_rx.recv().unwrap();

        let result = lock.lock();
        assert!(matches!(result, Err(KernelError::LockTimeout(ref name)) if name == "busy"));

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        assert!(lock.lock().is_ok(), "lock must be free after the holder exits");
    }

    #[test]
    fn system_then_component_is_allowed() {
        let outer = TimedLock::new("system", LockRank::System, Duration::from_millis(50), ());
        let inner = TimedLock::new("tasks", LockRank::Component, Duration::from_millis(50), ());
        let _o = outer.lock().unwrap();
        let _i = inner.lock().unwrap();
    }

    #[test]
    fn rank_is_released_after_guard_drop() {
        let outer = TimedLock::new("system", LockRank::System, Duration::from_millis(50), ());
        let inner = TimedLock::new("tasks", LockRank::Component, Duration::from_millis(50), ());
        {
            let _i = inner.lock().unwrap();
        }
        // Inner guard dropped, so taking the outer lock is in order again.
        let _o = outer.lock().unwrap();
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "lock order violation")]
    fn component_then_system_panics() {
        let outer = TimedLock::new("system", LockRank::System, Duration::from_millis(50), ());
        let inner = TimedLock::new("tasks", LockRank::Component, Duration::from_millis(50), ());
        let _i = inner.lock().unwrap();
        let _o = outer.lock();
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "lock order violation")]
    fn two_component_locks_panic() {
        let tasks = TimedLock::new("tasks", LockRank::Component, Duration::from_millis(50), ());
        let memory = TimedLock::new("memory", LockRank::Component, Duration::from_millis(50), ());
        let _t = tasks.lock().unwrap();
        let _m = memory.lock();
    }
}
