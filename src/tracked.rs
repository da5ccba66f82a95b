//! Strong/weak reference pair with unreachable-callbacks.
//!
//! `Tracked<V>` is a shared strong handle. `WeakHandle<V>` observes the
//! same value without keeping it alive. Callbacks registered through
//! `Tracked::on_unreachable` run exactly once, on whichever thread drops
//! the last strong handle, after every `WeakHandle` has already stopped
//! resolving. Callbacks must not panic and must not block.

use core::fmt;
use core::ops::Deref;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Identifies one registration made with `Tracked::on_unreachable`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct HookId(u64);

#[derive(Default)]
struct Hooks {
    next: u64,
    pending: Vec<(HookId, Callback)>,
}

struct Inner<V> {
    value: V,
    hooks: Mutex<Hooks>,
}

impl<V> Drop for Inner<V> {
    fn drop(&mut self) {
        // Strong count is already zero: weak handles no longer resolve.
        let pending = core::mem::take(&mut self.hooks.get_mut().pending);
        for (_, callback) in pending {
            callback();
        }
    }
}

/// Strong handle to a value that can be stored in a `WeakValueMap`.
pub struct Tracked<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Tracked<V> {
    pub fn new(value: V) -> Self {
        Self {
            inner: Arc::new(Inner {
                value,
                hooks: Mutex::new(Hooks::default()),
            }),
        }
    }

    /// Create a weak handle to this value.
    pub fn downgrade(this: &Self) -> WeakHandle<V> {
        WeakHandle {
            inner: Arc::downgrade(&this.inner),
        }
    }

    /// True if both handles point at the same allocation.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub fn strong_count(this: &Self) -> usize {
        Arc::strong_count(&this.inner)
    }

    /// Register `callback` to run once when the last strong handle is dropped.
    pub fn on_unreachable<F>(this: &Self, callback: F) -> HookId
    where
        F: FnOnce() + Send + 'static,
    {
        let mut hooks = this.inner.hooks.lock();
        let id = HookId(hooks.next);
        hooks.next += 1;
        hooks.pending.push((id, Box::new(callback)));
        id
    }

    /// Unregister a callback. Returns false if it was not registered here.
    pub fn cancel_hook(this: &Self, id: HookId) -> bool {
        let removed = {
            let mut hooks = this.inner.hooks.lock();
            let pos = hooks.pending.iter().position(|(h, _)| *h == id);
            pos.map(|i| hooks.pending.swap_remove(i))
        };
        // The callback may own arbitrary captures; drop them unlocked.
        removed.is_some()
    }

    #[cfg(test)]
    pub(crate) fn pending_hooks(this: &Self) -> usize {
        this.inner.hooks.lock().pending.len()
    }
}

impl<V> Clone for Tracked<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> Deref for Tracked<V> {
    type Target = V;

    #[inline]
    fn deref(&self) -> &V {
        &self.inner.value
    }
}

impl<V> AsRef<V> for Tracked<V> {
    fn as_ref(&self) -> &V {
        &self.inner.value
    }
}

impl<V: fmt::Debug> fmt::Debug for Tracked<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner.value, f)
    }
}

impl<V: PartialEq> PartialEq for Tracked<V> {
    fn eq(&self, other: &Self) -> bool {
        Tracked::ptr_eq(self, other) || self.inner.value == other.inner.value
    }
}

impl<V: Eq> Eq for Tracked<V> {}

/// Weak side of a `Tracked` value.
pub struct WeakHandle<V> {
    inner: Weak<Inner<V>>,
}

impl<V> WeakHandle<V> {
    /// A handle that never resolves.
    pub fn new() -> Self {
        Self { inner: Weak::new() }
    }

    /// Obtain a strong handle if the value is still alive.
    pub fn try_resolve(&self) -> Option<Tracked<V>> {
        self.inner.upgrade().map(|inner| Tracked { inner })
    }

    /// Aliveness check that does not take a strong reference.
    #[inline]
    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.inner, &other.inner)
    }
}

impl<V> Default for WeakHandle<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for WeakHandle<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<V> fmt::Debug for WeakHandle<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_alive() {
            f.write_str("WeakHandle(live)")
        } else {
            f.write_str("WeakHandle(reclaimed)")
        }
    }
}
