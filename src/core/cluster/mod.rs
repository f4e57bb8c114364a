// src/core/cluster/mod.rs

//! The slot-routing layer used when cluster mode is on: the 16384-slot hash
//! space, the owner table, and MOVED/ASK redirect decisions.

pub mod slot;
pub mod state;

pub use slot::{NUM_SLOTS, compact_slot_ranges, key_hash_slot, keys_in_same_slot};
pub use state::{ClusterState, Node, NodeFlags};
