//! Merged key/value store.
//!
//! A participant owns two backing stores, one per identity: the listener's
//! (`owner`) and the dialer's (`peer`). [`MergedStore`] presents them as one
//! store. Writes and deletes hit both under a single lock, so no reader ever
//! sees a key present in one backing store and stale in the other.

use std::collections::BTreeMap;

use huddle_core::HuddleError;
use parking_lot::RwLock;
use serde_json::Value;

use crate::protocol::StoreScope;

/// One of the two backing stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The listener identity's store.
    Owner,
    /// The dialer identity's store.
    Peer,
}

#[derive(Debug, Default)]
struct Backing {
    owner: BTreeMap<String, Value>,
    peer: BTreeMap<String, Value>,
}

impl Backing {
    fn side_mut(&mut self, side: Side) -> &mut BTreeMap<String, Value> {
        match side {
            Side::Owner => &mut self.owner,
            Side::Peer => &mut self.peer,
        }
    }

    fn side(&self, side: Side) -> &BTreeMap<String, Value> {
        match side {
            Side::Owner => &self.owner,
            Side::Peer => &self.peer,
        }
    }
}

#[derive(Debug)]
pub struct MergedStore {
    scope: StoreScope,
    inner: RwLock<Backing>,
}

impl MergedStore {
    pub fn new(scope: StoreScope) -> Self {
        Self {
            scope,
            inner: RwLock::new(Backing::default()),
        }
    }

    pub fn scope(&self) -> StoreScope {
        self.scope
    }

    /// Look `key` up in the owner store, falling back to the peer store.
    pub fn read(&self, key: &str) -> huddle_core::Result<Value> {
        self.get(key)
            .ok_or_else(|| HuddleError::KeyNotFound(format!("{}/{key}", self.scope)))
    }

    /// Like [`read`](Self::read) but returns `None` when absent.
    pub fn get(&self, key: &str) -> Option<Value> {
        let backing = self.inner.read();
        backing
            .owner
            .get(key)
            .or_else(|| backing.peer.get(key))
            .cloned()
    }

    /// Write `key` to both backing stores atomically.
    pub fn write(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let mut backing = self.inner.write();
        backing.owner.insert(key.clone(), value.clone());
        backing.peer.insert(key, value);
    }

    /// Delete `key` from both backing stores. Returns whether either held it.
    pub fn delete(&self, key: &str) -> bool {
        let mut backing = self.inner.write();
        let owner = backing.owner.remove(key).is_some();
        let peer = backing.peer.remove(key).is_some();
        owner || peer
    }

    /// Keys of the owner store only.
    ///
    /// A key that reached the peer store alone (see [`write_side`](Self::write_side))
    /// is readable but not listed here.
    pub fn enumerate(&self) -> Vec<String> {
        self.inner.read().owner.keys().cloned().collect()
    }

    /// Owner-store contents, as sent in a full replication flush.
    pub fn entries(&self) -> BTreeMap<String, Value> {
        self.inner.read().owner.clone()
    }

    /// Write to a single backing store, bypassing the merge.
    pub fn write_side(&self, side: Side, key: impl Into<String>, value: Value) {
        self.inner.write().side_mut(side).insert(key.into(), value);
    }

    pub fn read_side(&self, side: Side, key: &str) -> Option<Value> {
        self.inner.read().side(side).get(key).cloned()
    }

    /// Number of enumerable keys.
    pub fn len(&self) -> usize {
        self.inner.read().owner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
