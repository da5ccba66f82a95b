//! Exclusion lock with a debug-only reentrancy check.
//!
//! Wraps `parking_lot::Mutex` and only exposes scoped access, so the
//! protected state is never reachable outside a lock scope. In debug
//! builds the lock remembers which thread holds it; entering a blocking
//! scope from the thread that already holds it panics instead of
//! deadlocking. In release builds the check compiles to nothing.
//!
//! The non-blocking `try_with_lock` never performs the check: it is the
//! path taken by reclamation hooks, which may legitimately run on the
//! thread that currently holds the lock.

use parking_lot::{Mutex, MutexGuard};
#[cfg(debug_assertions)]
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(debug_assertions)]
const NO_OWNER: usize = 0;

/// Small per-thread id; zero is reserved for "unowned".
#[cfg(debug_assertions)]
fn thread_token() -> usize {
    static NEXT: AtomicUsize = AtomicUsize::new(1);
    thread_local! {
        static TOKEN: usize = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    TOKEN.with(|t| *t)
}

#[derive(Debug)]
pub struct ExclusionLock<T> {
    inner: Mutex<T>,
    #[cfg(debug_assertions)]
    owner: AtomicUsize,
}

impl<T> ExclusionLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            #[cfg(debug_assertions)]
            owner: AtomicUsize::new(NO_OWNER),
        }
    }

    /// Run `action` with exclusive access. The lock is released on every
    /// exit path, unwinding included.
    pub fn with_lock<R>(&self, action: impl FnOnce(&mut T) -> R) -> R {
        #[cfg(debug_assertions)]
        assert!(
            self.owner.load(Ordering::Relaxed) != thread_token(),
            "reentrancy detected: nested entry into a locked map"
        );
        let mut scope = self.enter(self.inner.lock());
        action(&mut *scope.guard)
    }

    /// Like `with_lock`, but returns `None` instead of waiting when the
    /// lock is held by anyone, the calling thread included.
    pub fn try_with_lock<R>(&self, action: impl FnOnce(&mut T) -> R) -> Option<R> {
        let guard = self.inner.try_lock()?;
        let mut scope = self.enter(guard);
        Some(action(&mut *scope.guard))
    }

    /// Point-in-time answer; may be stale by the time it is observed.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Exclusive access through `&mut self`; no locking required.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    fn enter<'a>(&'a self, guard: MutexGuard<'a, T>) -> Scope<'a, T> {
        #[cfg(debug_assertions)]
        self.owner.store(thread_token(), Ordering::Relaxed);
        Scope { lock: self, guard }
    }
}

/// RAII scope: clears the owner record before the mutex guard unlocks.
struct Scope<'a, T> {
    #[cfg_attr(not(debug_assertions), allow(dead_code))]
    lock: &'a ExclusionLock<T>,
    guard: MutexGuard<'a, T>,
}

impl<'a, T> Drop for Scope<'a, T> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        self.lock.owner.store(NO_OWNER, Ordering::Relaxed);
    }
}
