//! SlotTable: backing table with generational slot ids.
//!
//! Storage lives in a `SlotMap` and a `hashbrown::HashTable` indexes it by
//! key hash. Each entry keeps its precomputed hash, so `K: Hash` is never
//! called again after insertion (rehashing reads the stored hash).
//!
//! A `SlotId` names one insertion. Replacing or removing a key retires its
//! id for good: a stale id never resolves, even if the physical slot is
//! reused by a later insertion.

use core::borrow::Borrow;
use core::hash::{BuildHasher, Hash};
use hashbrown::hash_table::Entry as IndexEntry;
use hashbrown::HashTable;
use slotmap::{DefaultKey, SlotMap};
use std::collections::hash_map::RandomState;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SlotId(DefaultKey);

#[derive(Debug)]
struct Entry<K, V> {
    key: K,
    value: V,
    hash: u64,
}

pub struct SlotTable<K, V, S = RandomState> {
    hasher: S,
    index: HashTable<DefaultKey>,
    slots: SlotMap<DefaultKey, Entry<K, V>>,
}

impl<K, V> SlotTable<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self::with_hasher(Default::default())
    }
}

impl<K, V> Default for SlotTable<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over entries in `SlotTable`.
pub struct Iter<'a, K, V> {
    it: slotmap::basic::Iter<'a, DefaultKey, Entry<K, V>>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (SlotId, &'a K, &'a V);
    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.it
            .next()
            .map(|(k, e)| (SlotId(k), &e.key, &e.value))
    }
}

impl<K, V, S> SlotTable<K, V, S> {
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_capacity_and_hasher(0, hasher)
    }

    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Self {
        Self {
            index: HashTable::with_capacity(capacity),
            hasher,
            slots: SlotMap::with_capacity_and_key(capacity),
        }
    }

    pub fn hasher(&self) -> &S {
        &self.hasher
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, id: SlotId) -> Option<(&K, &V)> {
        self.slots.get(id.0).map(|e| (&e.key, &e.value))
    }

    pub fn value(&self, id: SlotId) -> Option<&V> {
        self.slots.get(id.0).map(|e| &e.value)
    }

    pub fn value_mut(&mut self, id: SlotId) -> Option<&mut V> {
        self.slots.get_mut(id.0).map(|e| &mut e.value)
    }

    pub fn remove(&mut self, id: SlotId) -> Option<(K, V)> {
        let k = id.0;

        // Remove slot
        let entry = self.slots.remove(k)?;

        // Unlink from index; the stored hash locates it without rehashing.
        if let Ok(found) = self.index.find_entry(entry.hash, |&kk| kk == k) {
            found.remove();
        }

        Some((entry.key, entry.value))
    }

    /// Ids of every entry at this instant.
    pub fn ids(&self) -> Vec<SlotId> {
        self.slots.keys().map(SlotId).collect()
    }

    /// Remove every entry for which `keep` returns false and hand the
    /// removed pairs back to the caller.
    pub fn retain<F>(&mut self, mut keep: F) -> Vec<(K, V)>
    where
        F: FnMut(SlotId, &K, &V) -> bool,
    {
        let doomed: Vec<SlotId> = self
            .iter()
            .filter(|(id, k, v)| !keep(*id, *k, *v))
            .map(|(id, _, _)| id)
            .collect();
        doomed.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Remove all entries, returning them.
    pub fn drain(&mut self) -> Vec<(K, V)> {
        self.index.clear();
        self.slots.drain().map(|(_, e)| (e.key, e.value)).collect()
    }

    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            it: self.slots.iter(),
        }
    }
}

impl<K, V, S> SlotTable<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    fn make_hash<Q>(&self, q: &Q) -> u64
    where
        Q: ?Sized + Hash,
    {
        self.hasher.hash_one(q)
    }

    pub fn find<Q>(&self, q: &Q) -> Option<SlotId>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.make_hash(q);
        self.index
            .find(hash, |&k| {
                self.slots
                    .get(k)
                    .map(|e| e.key.borrow() == q)
                    .unwrap_or(false)
            })
            .map(|&k| SlotId(k))
    }

    #[cfg(test)]
    pub fn contains_key<Q>(&self, q: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.find(q).is_some()
    }

    /// Insert `key -> value`, replacing any existing entry for the key.
    /// The replaced pair is returned and its id is retired.
    pub fn insert(&mut self, key: K, value: V) -> (SlotId, Option<(K, V)>) {
        let hash = self.make_hash(&key);
        let entry = Entry { key, value, hash };
        match self.index.entry(
            hash,
            |&kk| {
                self.slots
                    .get(kk)
                    .map(|e| e.key == entry.key)
                    .unwrap_or(false)
            },
            |&kk| self.slots.get(kk).map(|e| e.hash).unwrap_or(0),
        ) {
            IndexEntry::Occupied(mut o) => {
                let old = *o.get();
                let k = self.slots.insert(entry);
                *o.get_mut() = k;
                let replaced = self.slots.remove(old).map(|e| (e.key, e.value));
                (SlotId(k), replaced)
            }
            IndexEntry::Vacant(v) => {
                let k = self.slots.insert(entry);
                let _ = v.insert(k);
                (SlotId(k), None)
            }
        }
    }

    pub fn remove_key<Q>(&mut self, q: &Q) -> Option<(K, V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let id = self.find(q)?;
        self.remove(id)
    }
}
