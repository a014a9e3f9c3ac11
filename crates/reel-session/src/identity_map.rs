//! Identity Map pattern: one managed instance per stored row.
//!
//! Entries are keyed by `(entity, identity)`. Entities whose identity the
//! store assigns on insert are held under a provisional key until the flush
//! that inserts them, then rekeyed. A second index by instance address lets
//! the session recognise a handle it already manages regardless of identity.
//!
//! # Example
//!
//! ```ignore
//! let mut map = IdentityMap::new();
//! let key = map.provisional_key("Movie");
//! map.insert(key, Entry::pending(movie.erase()));
//!
//! // Later, once the store has assigned 42:
//! map.rekey(&key, 42);
//! assert!(map.get(&EntityKey::stored("Movie", 42)).is_some());
//! ```

use std::collections::HashMap;
use std::fmt;

use reel_core::AnyRef;

use crate::change_tracker::Snapshot;

/// Identity part of an [`EntityKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyId {
    /// Identity of a stored row.
    Stored(i64),
    /// Placeholder for an identity the store has not assigned yet.
    Provisional(u64),
}

/// Unique key for an entity in the identity map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub entity: &'static str,
    pub id: KeyId,
}

impl EntityKey {
    pub const fn stored(entity: &'static str, id: i64) -> Self {
        Self {
            entity,
            id: KeyId::Stored(id),
        }
    }

    pub const fn is_provisional(&self) -> bool {
        matches!(self.id, KeyId::Provisional(_))
    }

    /// The stored identity, if the row exists.
    pub const fn identity(&self) -> Option<i64> {
        match self.id {
            KeyId::Stored(id) => Some(id),
            KeyId::Provisional(_) => None,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            KeyId::Stored(id) => write!(f, "{}#{id}", self.entity),
            KeyId::Provisional(n) => write!(f, "{}#new-{n}", self.entity),
        }
    }
}

/// Tracking state of a managed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Managed,
    /// Scheduled for deletion at the next flush.
    Removed,
}

/// A managed instance and what the session knows about it.
#[derive(Debug)]
pub struct Entry {
    pub handle: AnyRef,
    pub state: EntryState,
    /// Last-known persisted state; `None` until the row is inserted.
    pub baseline: Option<Snapshot>,
    /// Registration order, used to keep flush ordering deterministic.
    pub order: u64,
}

impl Entry {
    /// An entity registered in memory and not yet inserted.
    pub fn pending(handle: AnyRef) -> Self {
        Self {
            handle,
            state: EntryState::Managed,
            baseline: None,
            order: 0,
        }
    }

    /// An entity read from the store.
    pub fn loaded(handle: AnyRef, baseline: Snapshot) -> Self {
        Self {
            handle,
            state: EntryState::Managed,
            baseline: Some(baseline),
            order: 0,
        }
    }

    pub fn is_pending_insert(&self) -> bool {
        self.baseline.is_none()
    }
}

/// Per-session map of managed instances.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: HashMap<EntityKey, Entry>,
    by_addr: HashMap<usize, EntityKey>,
    next_provisional: u64,
    next_order: u64,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh provisional key for `entity`.
    pub fn provisional_key(&mut self, entity: &'static str) -> EntityKey {
        self.next_provisional += 1;
        EntityKey {
            entity,
            id: KeyId::Provisional(self.next_provisional),
        }
    }

    /// Track `entry` under `key`, replacing any previous entry.
    pub fn insert(&mut self, key: EntityKey, mut entry: Entry) {
        self.next_order += 1;
        entry.order = self.next_order;
        tracing::trace!(key = %key, "Tracking entity");
        self.by_addr.insert(entry.handle.addr(), key);
        if let Some(previous) = self.entries.insert(key, entry) {
            self.by_addr.remove(&previous.handle.addr());
            if let Some(current) = self.entries.get(&key) {
                self.by_addr.insert(current.handle.addr(), key);
            }
        }
    }

    pub fn get(&self, key: &EntityKey) -> Option<&Entry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &EntityKey) -> Option<&mut Entry> {
        self.entries.get_mut(key)
    }

    pub fn contains_key(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Key under which this exact instance is tracked.
    pub fn key_of(&self, handle: &AnyRef) -> Option<EntityKey> {
        self.by_addr.get(&handle.addr()).copied()
    }

    pub fn remove(&mut self, key: &EntityKey) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.by_addr.remove(&entry.handle.addr());
        tracing::trace!(key = %key, "Untracking entity");
        Some(entry)
    }

    /// Move a provisional entry under the identity the store assigned.
    pub fn rekey(&mut self, key: &EntityKey, identity: i64) -> Option<EntityKey> {
        let entry = self.entries.remove(key)?;
        let stored = EntityKey::stored(key.entity, identity);
        self.by_addr.insert(entry.handle.addr(), stored);
        self.entries.insert(stored, entry);
        tracing::trace!(from = %key, to = %stored, "Rekeyed entity");
        Some(stored)
    }

    /// Keys of every entry, in registration order.
    pub fn keys_in_order(&self) -> Vec<EntityKey> {
        let mut keys: Vec<(u64, EntityKey)> = self
            .entries
            .iter()
            .map(|(key, entry)| (entry.order, *key))
            .collect();
        keys.sort_unstable_by_key(|(order, _)| *order);
        keys.into_iter().map(|(_, key)| key).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EntityKey, &Entry)> {
        self.entries.iter()
    }

    /// Empty the map, returning every entry.
    pub fn drain(&mut self) -> Vec<(EntityKey, Entry)> {
        self.by_addr.clear();
        self.entries.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
