//! WeakValueMap: public map layered on SlotTable, ExclusionLock and the
//! reclamation hooks registered on each stored value.

use crate::error::{Error, Result};
use crate::lock::ExclusionLock;
use crate::slot_table::{SlotId, SlotTable};
use crate::tracked::{HookId, Tracked, WeakHandle};
use core::borrow::Borrow;
use core::hash::{BuildHasher, Hash};
use core::iter::FusedIterator;
use crossbeam_channel::{Receiver, Sender};
use std::collections::hash_map::RandomState;
use std::sync::Arc;
use tracing::{debug, trace};

/// Table value: weak handle plus the hook registered for this insertion.
struct WeakSlot<V> {
    handle: WeakHandle<V>,
    hook: Option<HookId>,
}

impl<V> WeakSlot<V> {
    #[inline]
    fn is_alive(&self) -> bool {
        self.handle.is_alive()
    }

    #[inline]
    fn resolve(&self) -> Option<Tracked<V>> {
        self.handle.try_resolve()
    }

    /// Unregister the hook of a slot that left the table. Must run with
    /// the lock released: the temporary strong handle may be the last one.
    fn detach(self) {
        if let (Some(hook), Some(value)) = (self.hook, self.handle.try_resolve()) {
            Tracked::cancel_hook(&value, hook);
        }
    }
}

type Table<K, V, S> = SlotTable<K, WeakSlot<V>, S>;

/// Keys and slots that left the table during a lock scope. Both are
/// dropped only after the lock is released, since either may run user
/// `Drop` code that calls back into the map.
struct Graveyard<K, V> {
    keys: Vec<K>,
    slots: Vec<WeakSlot<V>>,
}

impl<K, V> Graveyard<K, V> {
    fn new() -> Self {
        Self {
            keys: Vec::new(),
            slots: Vec::new(),
        }
    }

    fn push(&mut self, (key, slot): (K, WeakSlot<V>)) {
        self.keys.push(key);
        self.slots.push(slot);
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    /// Detach every slot, then drop the keys. Must run unlocked.
    fn bury(self) {
        for ws in self.slots {
            ws.detach();
        }
        drop(self.keys);
    }
}

impl<K, V> Extend<(K, WeakSlot<V>)> for Graveyard<K, V> {
    fn extend<I: IntoIterator<Item = (K, WeakSlot<V>)>>(&mut self, iter: I) {
        for entry in iter {
            self.push(entry);
        }
    }
}

struct Shared<K, V, S> {
    table: ExclusionLock<Table<K, V, S>>,
    // Reclamations that found the lock busy.
    deferred_tx: Sender<SlotId>,
    deferred_rx: Receiver<SlotId>,
}

/// Remove `slot` if it still exists and its value is gone. A stale id
/// (the key was removed or overwritten since) resolves to nothing.
fn remove_if_reclaimed<K, V, S>(
    table: &mut Table<K, V, S>,
    slot: SlotId,
) -> Option<(K, WeakSlot<V>)> {
    let reclaimed = table.value(slot).is_some_and(|ws| !ws.is_alive());
    if !reclaimed {
        return None;
    }
    debug!(?slot, "removing reclaimed slot");
    table.remove(slot)
}

impl<K, V, S> Shared<K, V, S> {
    fn new(table: Table<K, V, S>) -> Self {
        let (deferred_tx, deferred_rx) = crossbeam_channel::unbounded();
        Self {
            table: ExclusionLock::new(table),
            deferred_tx,
            deferred_rx,
        }
    }

    /// Run `action` under the lock. Deferred reclamations are applied
    /// before and after it, and slots removed in the scope are detached
    /// once the lock is released.
    fn with_table<R>(
        &self,
        action: impl FnOnce(&mut Table<K, V, S>, &mut Graveyard<K, V>) -> R,
    ) -> R {
        let (out, graveyard) = self.table.with_lock(|table| {
            let mut graveyard = Graveyard::new();
            self.drain_deferred(table, &mut graveyard);
            let out = action(table, &mut graveyard);
            self.drain_deferred(table, &mut graveyard);
            (out, graveyard)
        });
        graveyard.bury();
        self.retry_deferred();
        out
    }

    fn drain_deferred(&self, table: &mut Table<K, V, S>, graveyard: &mut Graveyard<K, V>) {
        let before = graveyard.len();
        for slot in self.deferred_rx.try_iter() {
            graveyard.extend(remove_if_reclaimed(table, slot));
        }
        if graveyard.len() > before {
            trace!(count = graveyard.len() - before, "applied deferred reclamations");
        }
    }

    /// Non-blocking attempt to apply whatever is still queued.
    fn retry_deferred(&self) {
        if self.deferred_rx.is_empty() {
            return;
        }
        if let Some(graveyard) = self.table.try_with_lock(|table| {
            let mut graveyard = Graveyard::new();
            self.drain_deferred(table, &mut graveyard);
            graveyard
        }) {
            graveyard.bury();
        }
    }

    /// Reclamation hook body. Never blocks: when the lock is busy the
    /// request is queued for the next lock holder.
    fn reclaim(&self, slot: SlotId) {
        let attempt = self.table.try_with_lock(|table| {
            let mut graveyard = Graveyard::new();
            self.drain_deferred(table, &mut graveyard);
            graveyard.extend(remove_if_reclaimed(table, slot));
            graveyard
        });
        match attempt {
            Some(graveyard) => graveyard.bury(),
            None => {
                trace!(?slot, "map busy, deferring reclamation");
                // The receiver lives in `self`, so the channel is connected.
                let _ = self.deferred_tx.send(slot);
                // The holder may have released between our attempt and the send.
                self.retry_deferred();
            }
        }
    }
}

impl<K, V, S> Drop for Shared<K, V, S> {
    fn drop(&mut self) {
        // Values that outlive the map should not keep dead callbacks around.
        let mut graveyard = Graveyard::new();
        graveyard.extend(self.table.get_mut().drain());
        graveyard.bury();
    }
}

/// A thread-safe map that holds its values weakly.
///
/// Values are stored as `Tracked<V>`. The map keeps only a weak handle;
/// once every strong handle is dropped the entry is reclaimed and removed
/// the next time the map's lock is free. Until then the entry still counts
/// towards `len()` but every read treats it as absent.
pub struct WeakValueMap<K, V, S = RandomState> {
    shared: Arc<Shared<K, V, S>>,
}

impl<K, V> WeakValueMap<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self::with_hasher(Default::default())
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, Default::default())
    }
}

impl<K, V> Default for WeakValueMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> WeakValueMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_capacity_and_hasher(0, hasher)
    }

    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Self {
        Self {
            shared: Arc::new(Shared::new(SlotTable::with_capacity_and_hasher(
                capacity, hasher,
            ))),
        }
    }
}

impl<K, V, S> WeakValueMap<K, V, S>
where
    K: Eq + Hash + Send + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Send + Sync + 'static,
{
    /// Number of slots, reclaimed-but-not-yet-removed ones included.
    pub fn len(&self) -> usize {
        self.shared.with_table(|table, _| table.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store a weak handle to `value` under `key`, replacing any previous
    /// slot. Returns the previous value if it was still alive.
    pub fn insert(&self, key: K, value: &Tracked<V>) -> Option<Tracked<V>> {
        self.shared.with_table(|table, graveyard| {
            let replaced = self.insert_locked(table, key, value)?;
            let previous = replaced.1.resolve();
            graveyard.push(replaced);
            previous
        })
    }

    fn insert_locked(
        &self,
        table: &mut Table<K, V, S>,
        key: K,
        value: &Tracked<V>,
    ) -> Option<(K, WeakSlot<V>)> {
        let slot = WeakSlot {
            handle: Tracked::downgrade(value),
            hook: None,
        };
        let (id, replaced) = table.insert(key, slot);
        // The hook only holds the map weakly; a dropped map makes it a no-op.
        let map = Arc::downgrade(&self.shared);
        let hook = Tracked::on_unreachable(value, move || {
            if let Some(shared) = map.upgrade() {
                shared.reclaim(id);
            }
        });
        if let Some(ws) = table.value_mut(id) {
            ws.hook = Some(hook);
        }
        replaced
    }

    /// Live value for `q`, or `Error::KeyNotFound`.
    pub fn get<Q>(&self, q: &Q) -> Result<Tracked<V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.shared
            .with_table(|table, _| Self::resolve_locked(table, q))
            .ok_or(Error::KeyNotFound)
    }

    fn resolve_locked<Q>(table: &Table<K, V, S>, q: &Q) -> Option<Tracked<V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        table
            .find(q)
            .and_then(|id| table.value(id))
            .and_then(WeakSlot::resolve)
    }

    /// Live value for `q`, or `default`. Never inserts.
    pub fn get_or<Q>(&self, q: &Q, default: Tracked<V>) -> Tracked<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.get(q).unwrap_or(default)
    }

    /// Live value for `q`, or the result of `default`. Never inserts;
    /// `default` runs outside the lock.
    pub fn get_or_else<Q, F>(&self, q: &Q, default: F) -> Tracked<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        F: FnOnce() -> Tracked<V>,
    {
        self.get(q).unwrap_or_else(|_| default())
    }

    /// Live value for `key`, inserting `value` if there is none.
    pub fn get_or_insert(&self, key: K, value: Tracked<V>) -> Tracked<V> {
        self.get_or_insert_with(key, move || value)
    }

    /// Live value for `key`; otherwise `default` runs once, under the lock,
    /// and its result is inserted. Racing callers on the same key never
    /// run `default` twice. `default` must not call back into this map.
    pub fn get_or_insert_with<F>(&self, key: K, default: F) -> Tracked<V>
    where
        F: FnOnce() -> Tracked<V>,
    {
        self.shared.with_table(|table, graveyard| {
            if let Some(live) = Self::resolve_locked(table, &key) {
                graveyard.keys.push(key);
                return live;
            }
            let value = default();
            graveyard.extend(self.insert_locked(table, key, &value));
            value
        })
    }

    /// Remove the slot for `q` whatever its state. Returns whether a slot
    /// existed; removing an absent key is a no-op.
    pub fn remove<Q>(&self, q: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.shared.with_table(|table, graveyard| match table.remove_key(q) {
            Some(entry) => {
                graveyard.push(entry);
                true
            }
            None => false,
        })
    }

    /// Remove the slot for `q` and return its value if it was alive.
    pub fn pop<Q>(&self, q: &Q) -> Result<Tracked<V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.shared
            .with_table(|table, graveyard| {
                let entry = table.remove_key(q)?;
                let live = entry.1.resolve();
                graveyard.push(entry);
                live
            })
            .ok_or(Error::KeyNotFound)
    }

    pub fn pop_or<Q>(&self, q: &Q, default: Tracked<V>) -> Tracked<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.pop(q).unwrap_or(default)
    }

    /// Remove and return some live entry, or `None` if there is none.
    pub fn pop_any(&self) -> Option<(K, Tracked<V>)> {
        self.shared.with_table(|table, graveyard| {
            let (id, live) = table
                .iter()
                .find_map(|(id, _, ws)| ws.resolve().map(|v| (id, v)))?;
            let (key, ws) = table.remove(id)?;
            graveyard.slots.push(ws);
            Some((key, live))
        })
    }

    /// True only for keys whose value is still alive.
    pub fn contains_key<Q>(&self, q: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.shared.with_table(|table, _| {
            table
                .find(q)
                .and_then(|id| table.value(id))
                .is_some_and(WeakSlot::is_alive)
        })
    }

    /// Keep only the live entries for which `keep` returns true.
    /// Reclaimed slots are dropped without consulting `keep`, which runs
    /// under the lock and must not call back into this map.
    pub fn retain<F>(&self, mut keep: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let held = self.shared.with_table(|table, graveyard| {
            // Strong handles taken here are released after unlocking.
            let mut held = Vec::new();
            let removed = table.retain(|_, key, ws| match ws.resolve() {
                Some(value) => {
                    let kept = keep(key, &*value);
                    held.push(value);
                    kept
                }
                None => false,
            });
            graveyard.extend(removed);
            held
        });
        drop(held);
    }

    /// Remove every reclaimed slot now and return how many there were.
    pub fn purge(&self) -> usize {
        let purged = self.shared.with_table(|table, graveyard| {
            let removed = table.retain(|_, _, ws| ws.is_alive());
            let n = removed.len();
            graveyard.extend(removed);
            n
        });
        if purged > 0 {
            debug!(purged, "purged reclaimed slots");
        }
        purged
    }

    pub fn clear(&self) {
        self.shared.with_table(|table, graveyard| {
            graveyard.extend(table.drain());
        });
    }

    /// Weak handles for every live entry at this instant.
    pub fn weak_values(&self) -> Vec<WeakHandle<V>> {
        self.shared.with_table(|table, _| {
            table
                .iter()
                .filter(|(_, _, ws)| ws.is_alive())
                .map(|(_, _, ws)| ws.handle.clone())
                .collect()
        })
    }
}

impl<K, V, S> WeakValueMap<K, V, S>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Send + Sync + 'static,
{
    /// Live `(key, value)` pairs. Each step takes the lock on its own, so
    /// the sequence is not a snapshot: entries inserted after the call are
    /// not visited and entries reclaimed or removed meanwhile are skipped.
    pub fn iter(&self) -> Iter<'_, K, V, S> {
        let pending = self.shared.with_table(|table, _| table.ids());
        Iter {
            map: self,
            pending: pending.into_iter(),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = Tracked<V>> + '_ {
        self.iter().map(|(_, v)| v)
    }
}

impl<K, V, S> Clone for WeakValueMap<K, V, S>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    /// Independent map over the currently live entries, with fresh weak
    /// handles and hooks. Reclaimed slots are not carried over.
    fn clone(&self) -> Self {
        let (hasher, live) = self.shared.with_table(|table, _| {
            let live: Vec<(K, Tracked<V>)> = table
                .iter()
                .filter_map(|(_, k, ws)| ws.resolve().map(|v| (k.clone(), v)))
                .collect();
            (table.hasher().clone(), live)
        });
        let copy = Self::with_capacity_and_hasher(live.len(), hasher);
        for (key, value) in live {
            copy.insert(key, &value);
        }
        copy
    }
}

/// Lazy iterator returned by `WeakValueMap::iter`.
pub struct Iter<'a, K, V, S = RandomState> {
    map: &'a WeakValueMap<K, V, S>,
    pending: std::vec::IntoIter<SlotId>,
}

impl<'a, K, V, S> Iterator for Iter<'a, K, V, S>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Send + Sync + 'static,
{
    type Item = (K, Tracked<V>);

    fn next(&mut self) -> Option<Self::Item> {
        for id in self.pending.by_ref() {
            let item = self.map.shared.with_table(|table, _| {
                let (key, ws) = table.get(id)?;
                ws.resolve().map(|v| (key.clone(), v))
            });
            if item.is_some() {
                return item;
            }
        }
        None
    }
}

impl<'a, K, V, S> FusedIterator for Iter<'a, K, V, S>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Send + Sync + 'static,
{
}

impl<'a, K, V, S> IntoIterator for &'a WeakValueMap<K, V, S>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Send + Sync + 'static,
{
    type Item = (K, Tracked<V>);
    type IntoIter = Iter<'a, K, V, S>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
