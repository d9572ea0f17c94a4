//! Keyed concurrent map with scoped reservations.
//!
//! Transactions, replicators, and migrators all live in maps of per-entity
//! state machines. Handlers need two guarantees: the entry they dispatch
//! into cannot be destroyed mid-handler, and no two threads mutate one
//! entry at once. [`StateMap`] provides both through [`StateRef`]: the
//! reservation pins the entry, and locking the reservation yields exclusive
//! access. An entry is reclaimed only when its terminate flag is set and no
//! reservation remains.

use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hashbrown::HashMap;

#[derive(Debug)]
struct Slot<S> {
    state: Mutex<S>,
    terminated: AtomicBool,
}

/// Concurrent map of per-entity state machines.
#[derive(Debug)]
pub struct StateMap<K, S> {
    inner: Arc<Mutex<HashMap<K, Arc<Slot<S>>>>>,
}

impl<K, S> Default for StateMap<K, S>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, S> StateMap<K, S>
where
    K: Eq + Hash + Clone,
{
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Reserves the entry under `key`, creating it from `init` when absent.
    ///
    /// A terminated entry that still has outstanding reservations is not
    /// resurrected; the caller receives a fresh entry under the same key
    /// only after the old one is collected.
    pub fn get_or_create(&self, key: &K, init: impl FnOnce() -> S) -> StateRef<K, S> {
        let mut map = self.lock_inner();
        let slot = map
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Slot {
                    state: Mutex::new(init()),
                    terminated: AtomicBool::new(false),
                })
            })
            .clone();
        drop(map);
        StateRef {
            map: Arc::clone(&self.inner),
            key: key.clone(),
            slot,
        }
    }

    /// Reserves the entry under `key` only when it is brand new.
    ///
    /// Returns `None` when an entry already exists, mirroring id-collision
    /// handling at replicator creation.
    pub fn create(&self, key: &K, state: S) -> Option<StateRef<K, S>> {
        let mut map = self.lock_inner();
        if map.contains_key(key) {
            return None;
        }
        let slot = Arc::new(Slot {
            state: Mutex::new(state),
            terminated: AtomicBool::new(false),
        });
        let _ = map.insert(key.clone(), Arc::clone(&slot));
        drop(map);
        Some(StateRef {
            map: Arc::clone(&self.inner),
            key: key.clone(),
            slot,
        })
    }

    /// Reserves an existing entry.
    pub fn get(&self, key: &K) -> Option<StateRef<K, S>> {
        let map = self.lock_inner();
        let slot = map.get(key)?.clone();
        drop(map);
        Some(StateRef {
            map: Arc::clone(&self.inner),
            key: key.clone(),
            slot,
        })
    }

    /// Returns a point-in-time snapshot of all live keys.
    #[must_use]
    pub fn keys(&self) -> Vec<K> {
        self.lock_inner().keys().cloned().collect()
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_inner().len()
    }

    /// Whether the map holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock_inner().is_empty()
    }

    fn lock_inner(&self) -> MutexGuard<'_, HashMap<K, Arc<Slot<S>>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scoped reservation of one map entry.
///
/// While a reservation exists the entry stays in the map. Dropping the last
/// reservation of a terminated entry removes it.
#[derive(Debug)]
pub struct StateRef<K, S>
where
    K: Eq + Hash + Clone,
{
    map: Arc<Mutex<HashMap<K, Arc<Slot<S>>>>>,
    key: K,
    slot: Arc<Slot<S>>,
}

impl<K, S> StateRef<K, S>
where
    K: Eq + Hash + Clone,
{
    /// Locks the underlying state for exclusive access.
    ///
    /// Never lock two reservations at once; per-entity mutexes have no
    /// global order.
    pub fn lock(&self) -> MutexGuard<'_, S> {
        self.slot.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the entry's key.
    #[must_use]
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Marks the entry for collection once every reservation is dropped.
    pub fn terminate(&self) {
        self.slot.terminated.store(true, Ordering::Release);
    }

    /// Whether the entry is marked for collection.
    #[must_use]
    pub fn terminated(&self) -> bool {
        self.slot.terminated.load(Ordering::Acquire)
    }
}

impl<K, S> Drop for StateRef<K, S>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        if !self.slot.terminated.load(Ordering::Acquire) {
            return;
        }
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        // Two strong refs mean the map and this reservation are the only
        // owners left; the map's entry can go.
        if Arc::strong_count(&self.slot) == 2 {
            if let Some(current) = map.get(&self.key) {
                if Arc::ptr_eq(current, &self.slot) {
                    let _ = map.remove(&self.key);
                }
            }
        }
    }
}
