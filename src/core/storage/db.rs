// src/core/storage/db.rs

//! The in-memory keyspace. A single concurrent map with lazy expiry:
//! expired entries are dropped on access, and the snapshot writer filters
//! them out when it walks the store.

use crate::core::storage::data_types::{DataValue, StoredValue};
use bytes::Bytes;
use dashmap::DashMap;
use std::time::Instant;

#[derive(Debug, Default)]
pub struct Db {
    entries: DashMap<Bytes, StoredValue>,
}

impl Db {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetches a clone of the live value for `key`, reaping it if expired.
    pub fn get(&self, key: &Bytes) -> Option<StoredValue> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.value().is_expired() {
                return Some(entry.value().clone());
            }
        } else {
            return None;
        }
        // The entry existed but was expired; remove it outside the read guard.
        self.entries.remove(key);
        None
    }

    pub fn set(&self, key: Bytes, value: StoredValue) {
        self.entries.insert(key, value);
    }

    /// Removes `key`, returning whether a live entry was deleted.
    pub fn remove(&self, key: &Bytes) -> bool {
        match self.entries.remove(key) {
            Some((_, value)) => !value.is_expired(),
            None => false,
        }
    }

    pub fn exists(&self, key: &Bytes) -> bool {
        self.get(key).is_some()
    }

    /// Sets an absolute expiry on a live key. Returns false if the key is missing.
    pub fn expire_at(&self, key: &Bytes, at: Instant) -> bool {
        if self.get(key).is_none() {
            return false;
        }
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.value_mut().expiry = Some(at);
            return true;
        }
        false
    }

    /// Applies `f` to the value under `key`, inserting `default` first when absent.
    /// The update happens under the map shard lock, making read-modify-write atomic.
    pub fn update_or_insert_with<F, R>(&self, key: Bytes, default: impl Fn() -> DataValue, f: F) -> R
    where
        F: FnOnce(&mut StoredValue) -> R,
    {
        let mut entry = self.entries.entry(key).or_insert_with(|| StoredValue::new(default()));
        if entry.value().is_expired() {
            *entry.value_mut() = StoredValue::new(default());
        }
        f(entry.value_mut())
    }

    /// Number of live keys. Walks the map so expired-but-unreaped keys are not counted.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| !entry.value().is_expired())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshots all live key-value pairs. This is the iterator surface the
    /// snapshot writer and full-resync path consume.
    pub fn all_kvs(&self) -> Vec<(Bytes, StoredValue)> {
        self.entries
            .iter()
            .filter(|entry| !entry.value().is_expired())
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Inserts a value during snapshot or AOF load, bypassing command dispatch.
    pub fn insert_from_load(&self, key: Bytes, value: StoredValue) {
        if !value.is_expired() {
            self.entries.insert(key, value);
        }
    }

    /// Drops every entry. Used before a full snapshot load.
    pub fn clear(&self) {
        self.entries.clear();
    }
}
