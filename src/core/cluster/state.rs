// src/core/cluster/state.rs

//! Tracks cluster topology: known nodes and the ownership of all 16384 hash
//! slots. Ownership checks sit on the hot path of every keyed command, so the
//! owner table keeps an incrementally maintained `assigned_slots` counter
//! behind a reader-writer lock, making checks O(1).

use crate::core::JasperError;
use crate::core::cluster::slot::{NUM_SLOTS, key_hash_slot, keys_in_same_slot};
use bitflags::bitflags;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;

bitflags! {
    /// Status flags attached to a cluster node, mirroring the flags column
    /// of `CLUSTER NODES` output.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u16 {
        const MYSELF    = 1 << 0;
        const MASTER    = 1 << 1;
        const REPLICA   = 1 << 2;
        const FAIL      = 1 << 3;
        const PFAIL     = 1 << 4;
        const HANDSHAKE = 1 << 5;
        const NOADDR    = 1 << 6;
    }
}

/// A single node known to the cluster.
#[derive(Debug, Clone)]
pub struct Node {
    /// The node's unique 40-character hexadecimal id.
    pub id: String,
    pub address: String,
    pub port: u16,
    /// Slots this node owns, kept sorted.
    pub slots: Vec<u16>,
    pub flags: NodeFlags,
}

impl Node {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// The slot-owner table plus its derived counter, updated together under
/// one write lock so the counter never drifts from the table.
#[derive(Debug)]
struct OwnerTable {
    owners: Vec<Option<String>>,
    assigned_slots: usize,
}

/// The shared cluster state for this node.
#[derive(Debug)]
pub struct ClusterState {
    /// Whether cluster mode is enabled. When disabled every ownership check
    /// short-circuits to `Ok`.
    pub enabled: bool,
    /// This node's 40-hex id.
    pub my_id: String,
    /// All known nodes, keyed by node id.
    pub nodes: DashMap<String, Node>,
    /// Slots owned here that are being handed off, keyed to the target node
    /// id. Keys already moved out of such a slot answer with `ASK`.
    migrating_slots: DashMap<u16, String>,
    /// Slots being received from another node, keyed to the source node id.
    /// Served only to clients that announced `ASKING`.
    importing_slots: DashMap<u16, String>,
    owner_table: RwLock<OwnerTable>,
}

impl ClusterState {
    pub fn new(enabled: bool, my_id: String) -> Self {
        Self {
            enabled,
            my_id,
            nodes: DashMap::new(),
            migrating_slots: DashMap::new(),
            importing_slots: DashMap::new(),
            owner_table: RwLock::new(OwnerTable {
                owners: vec![None; NUM_SLOTS],
                assigned_slots: 0,
            }),
        }
    }

    /// Assigns a slot to a node, replacing any previous owner.
    pub fn assign_slot(&self, slot: u16, node_id: &str) {
        let mut table = self.owner_table.write();
        if table.owners[slot as usize].is_none() {
            table.assigned_slots += 1;
        }
        table.owners[slot as usize] = Some(node_id.to_string());
    }

    /// Clears a slot's owner.
    pub fn clear_slot(&self, slot: u16) {
        let mut table = self.owner_table.write();
        if table.owners[slot as usize].take().is_some() {
            table.assigned_slots -= 1;
        }
    }

    pub fn owner_of(&self, slot: u16) -> Option<String> {
        self.owner_table.read().owners[slot as usize].clone()
    }

    pub fn assigned_slots(&self) -> usize {
        self.owner_table.read().assigned_slots
    }

    /// The cluster is `ok` exactly when every slot has an owner.
    pub fn state_ok(&self) -> bool {
        self.assigned_slots() == NUM_SLOTS
    }

    pub fn i_own_slot(&self, slot: u16) -> bool {
        self.owner_table.read().owners[slot as usize].as_deref() == Some(self.my_id.as_str())
    }

    /// Marks a locally owned slot as migrating to `target_node`.
    pub fn set_slot_migrating(&self, slot: u16, target_node: &str) -> Result<(), JasperError> {
        if !self.i_own_slot(slot) {
            return Err(JasperError::InvalidState(
                "Cannot MIGRATE a slot I don't own".to_string(),
            ));
        }
        self.migrating_slots.insert(slot, target_node.to_string());
        Ok(())
    }

    /// Marks a slot as importing from `source_node`.
    pub fn set_slot_importing(&self, slot: u16, source_node: &str) {
        self.importing_slots.insert(slot, source_node.to_string());
    }

    /// Drops any migration state for a slot (`SETSLOT STABLE`).
    pub fn clear_slot_migration(&self, slot: u16) {
        self.migrating_slots.remove(&slot);
        self.importing_slots.remove(&slot);
    }

    /// Finalizes a migration: `node_id` becomes the slot's owner and the
    /// migration flags are dropped.
    pub fn finalize_slot_owner(&self, slot: u16, node_id: &str) -> Result<(), JasperError> {
        if !self.nodes.contains_key(node_id) {
            return Err(JasperError::InvalidState(format!(
                "Node {node_id} not found"
            )));
        }
        self.clear_slot_migration(slot);
        self.assign_slot(slot, node_id);
        Ok(())
    }

    fn node_addr(&self, id: &str) -> String {
        self.nodes
            .get(id)
            .map(|n| n.addr())
            .unwrap_or_else(|| "?:0".to_string())
    }

    /// Checks whether this node may serve a command on `key`.
    ///
    /// `asking` is the client's one-shot `ASKING` announcement; `key_present`
    /// says whether the key currently exists in the local store. The decision
    /// order, in cluster mode:
    ///
    /// 1. A slot we are importing is refused with `Moved` back to the source
    ///    unless the client announced `ASKING`.
    /// 2. A slot we are migrating answers `Ask` toward the target when the
    ///    key has already moved out (it no longer exists here).
    /// 3. An `ASKING` client is otherwise served.
    /// 4. A slot owned elsewhere answers `Moved`; an unassigned slot is
    ///    `ClusterDown`.
    pub fn check_key_ownership(
        &self,
        key: &[u8],
        asking: bool,
        key_present: bool,
    ) -> Result<(), JasperError> {
        if !self.enabled {
            return Ok(());
        }
        let slot = key_hash_slot(key);

        if !asking {
            if let Some(source) = self.importing_slots.get(&slot) {
                return Err(JasperError::Moved {
                    slot,
                    addr: self.node_addr(source.value()),
                });
            }
        }

        if !key_present {
            if let Some(target) = self.migrating_slots.get(&slot) {
                return Err(JasperError::Ask {
                    slot,
                    addr: self.node_addr(target.value()),
                });
            }
        }

        if asking {
            return Ok(());
        }

        match self.owner_of(slot) {
            Some(id) if id == self.my_id => Ok(()),
            Some(id) => Err(JasperError::Moved {
                slot,
                addr: self.node_addr(&id),
            }),
            None => Err(JasperError::ClusterDown(
                "Hash slot not served".to_string(),
            )),
        }
    }

    /// Validates a multi-key command: all keys must hash to a single slot
    /// that this node may serve.
    pub fn check_multi_key_ownership(
        &self,
        keys: &[Bytes],
        asking: bool,
        all_present: bool,
    ) -> Result<(), JasperError> {
        if !self.enabled || keys.is_empty() {
            return Ok(());
        }
        if !keys_in_same_slot(keys) {
            return Err(JasperError::CrossSlot);
        }
        self.check_key_ownership(&keys[0], asking, all_present)
    }

    /// Registers a node and takes over ownership of its slot list.
    pub fn add_node(&self, node: Node) {
        for &slot in &node.slots {
            self.assign_slot(slot, &node.id);
        }
        self.nodes.insert(node.id.clone(), node);
    }
}
