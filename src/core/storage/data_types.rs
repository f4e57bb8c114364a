// src/core/storage/data_types.rs

//! Defines the core data structures for storing values in the database,
//! such as `StoredValue` and the `DataValue` enum.

use bytes::Bytes;
use indexmap::IndexMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::time::Instant;

/// The value types a key can hold. Hashes preserve field insertion order,
/// which keeps snapshot output deterministic for a given store.
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    String(Bytes),
    List(VecDeque<Bytes>),
    Set(HashSet<Bytes>),
    Hash(IndexMap<Bytes, Bytes>),
}

impl DataValue {
    /// Returns the type name used by error messages and `TYPE`-style introspection.
    pub fn type_name(&self) -> &'static str {
        match self {
            DataValue::String(_) => "string",
            DataValue::List(_) => "list",
            DataValue::Set(_) => "set",
            DataValue::Hash(_) => "hash",
        }
    }
}

/// A wrapper for all values stored in the database, containing the data and metadata.
#[derive(Debug, Clone)]
pub struct StoredValue {
    pub data: DataValue,
    /// The time at which the value expires. `None` means the key is persistent.
    pub expiry: Option<Instant>,
}

impl StoredValue {
    /// Creates a new `StoredValue` without an expiry.
    pub fn new(data: DataValue) -> Self {
        Self { data, expiry: None }
    }

    /// Checks if the value is expired.
    pub fn is_expired(&self) -> bool {
        self.expiry.is_some_and(|exp| exp <= Instant::now())
    }

    /// Calculates the remaining time-to-live in seconds.
    pub fn remaining_ttl_secs(&self) -> Option<u64> {
        self.expiry
            .and_then(|expiry| expiry.checked_duration_since(Instant::now()))
            .map(|d| d.as_secs())
    }
}
