//! InFlightTable: keyed slot storage with generational handles.
//!
//! Each live entry gets a `Slot` handle when inserted. A slot outlives its
//! entry only as a stale value: once the entry is removed the slot never
//! resolves again, even if the same key is inserted afterwards. The
//! controller relies on this to tell one generation of a key from the next.

use core::borrow::Borrow;
use core::hash::{BuildHasher, Hash};
use hashbrown::HashTable;
use slotmap::{DefaultKey, SlotMap};
use std::collections::hash_map::RandomState;
use thiserror::Error;

/// Generational handle to one entry of an [`InFlightTable`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Slot(DefaultKey);

impl Slot {
    fn raw(self) -> DefaultKey {
        self.0
    }
}

#[derive(Debug)]
struct Stored<K, V> {
    key: K,
    value: V,
    hash: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InsertError {
    #[error("key already has a live entry")]
    DuplicateKey(Slot),
}

pub struct InFlightTable<K, V, S = RandomState> {
    hasher: S,
    index: HashTable<DefaultKey>,
    slots: SlotMap<DefaultKey, Stored<K, V>>,
}

impl<K, V> InFlightTable<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self::with_hasher(Default::default())
    }
}

impl<K, V> Default for InFlightTable<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> InFlightTable<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_capacity_and_hasher(0, hasher)
    }

    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Self {
        Self {
            hasher,
            index: HashTable::with_capacity(capacity),
            slots: SlotMap::with_capacity_and_key(capacity),
        }
    }

    fn make_hash<Q>(&self, q: &Q) -> u64
    where
        Q: ?Sized + Hash,
    {
        self.hasher.hash_one(q)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn find<Q>(&self, q: &Q) -> Option<Slot>
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
            .map(|&k| Slot(k))
    }

    pub fn contains_key<Q>(&self, q: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.find(q).is_some()
    }

    /// Lookup by key, returning the live slot together with its value.
    pub fn find_mut<Q>(&mut self, q: &Q) -> Option<(Slot, &mut V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let slot = self.find(q)?;
        self.slots.get_mut(slot.raw()).map(|e| (slot, &mut e.value))
    }

    pub fn get(&self, slot: Slot) -> Option<&V> {
        self.slots.get(slot.raw()).map(|e| &e.value)
    }

    /// Insert `key` with a value built from its slot-to-be.
    ///
    /// `make` runs only when the key is absent, and receives the slot the
    /// entry will live at, so the value can refer back to its own entry.
    pub fn insert_with<F>(&mut self, key: K, make: F) -> Result<Slot, InsertError>
    where
        F: FnOnce(Slot) -> V,
    {
        let hash = self.make_hash(&key);
        let slots = &mut self.slots;
        match self.index.entry(
            hash,
            |&kk| slots.get(kk).map(|e| e.key == key).unwrap_or(false),
            |&kk| slots.get(kk).map(|e| e.hash).unwrap_or(0),
        ) {
            hashbrown::hash_table::Entry::Occupied(o) => {
                Err(InsertError::DuplicateKey(Slot(*o.get())))
            }
            hashbrown::hash_table::Entry::Vacant(v) => {
                let k = slots.insert_with_key(|k| Stored {
                    key,
                    value: make(Slot(k)),
                    hash,
                });
                v.insert(k);
                Ok(Slot(k))
            }
        }
    }

    pub fn remove(&mut self, slot: Slot) -> Option<(K, V)> {
        let k = slot.raw();
        let stored = self.slots.remove(k)?;
        // A live slot is always indexed under its stored hash.
        if let Ok(found) = self.index.find_entry(stored.hash, |&kk| kk == k) {
            found.remove();
        }
        Some((stored.key, stored.value))
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.slots.values().map(|e| &e.key)
    }
}
