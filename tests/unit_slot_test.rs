use bytes::Bytes;
use jasperdb::core::JasperError;
use jasperdb::core::cluster::{
    ClusterState, NUM_SLOTS, Node, NodeFlags, compact_slot_ranges, key_hash_slot,
    keys_in_same_slot,
};

#[test]
fn test_hash_slot_is_stable_and_in_range() {
    for key in [&b"foo"[..], b"bar", b"user:1000", b""] {
        let slot = key_hash_slot(key);
        assert!((slot as usize) < NUM_SLOTS);
        assert_eq!(slot, key_hash_slot(key));
    }
}

#[test]
fn test_hash_tag_groups_keys_into_one_slot() {
    assert_eq!(key_hash_slot(b"{foo}bar"), key_hash_slot(b"{foo}baz"));
    assert_eq!(key_hash_slot(b"{user:1}:name"), key_hash_slot(b"{user:1}:age"));
    // Only the first tag counts.
    assert_eq!(key_hash_slot(b"{a}{b}"), key_hash_slot(b"{a}xyz"));
}

#[test]
fn test_empty_hash_tag_hashes_whole_key() {
    // "{}" carries no tag content, so the entire key is hashed.
    assert_eq!(key_hash_slot(b"{}foo"), key_hash_slot(b"{}foo"));
    assert_ne!(key_hash_slot(b"{}foo"), key_hash_slot(b"foo"));
}

#[test]
fn test_keys_in_same_slot_boundaries() {
    assert!(keys_in_same_slot(&[]));
    assert!(keys_in_same_slot(&[Bytes::from_static(b"solo")]));
    assert!(keys_in_same_slot(&[
        Bytes::from_static(b"{foo}bar"),
        Bytes::from_static(b"{foo}baz"),
    ]));
}

#[test]
fn test_compact_slot_ranges() {
    assert_eq!(compact_slot_ranges(&[]), vec![]);
    assert_eq!(compact_slot_ranges(&[5]), vec![(5, 5)]);
    assert_eq!(compact_slot_ranges(&[0, 1, 2, 3]), vec![(0, 3)]);
    assert_eq!(
        compact_slot_ranges(&[0, 1, 5, 6, 7, 100]),
        vec![(0, 1), (5, 7), (100, 100)]
    );
    assert_eq!(compact_slot_ranges(&[3, 3, 4]), vec![(3, 4)]);
}

#[test]
fn test_assigned_slots_counter_tracks_table() {
    let cluster = ClusterState::new(true, "a".repeat(40));
    assert_eq!(cluster.assigned_slots(), 0);
    assert!(!cluster.state_ok());

    cluster.assign_slot(0, "node1");
    cluster.assign_slot(1, "node1");
    assert_eq!(cluster.assigned_slots(), 2);

    // Reassigning an owned slot must not inflate the counter.
    cluster.assign_slot(1, "node2");
    assert_eq!(cluster.assigned_slots(), 2);
    assert_eq!(cluster.owner_of(1).as_deref(), Some("node2"));

    cluster.clear_slot(0);
    assert_eq!(cluster.assigned_slots(), 1);
    // Clearing an empty slot is a no-op.
    cluster.clear_slot(0);
    assert_eq!(cluster.assigned_slots(), 1);
}

#[test]
fn test_cluster_state_ok_requires_full_assignment() {
    let cluster = ClusterState::new(true, "me".repeat(20));
    for slot in 0..NUM_SLOTS as u16 {
        cluster.assign_slot(slot, "me");
    }
    assert_eq!(cluster.assigned_slots(), NUM_SLOTS);
    assert!(cluster.state_ok());
}

fn two_node_cluster() -> ClusterState {
    let my_id = "a".repeat(40);
    let other_id = "b".repeat(40);
    let cluster = ClusterState::new(true, my_id.clone());
    cluster.add_node(Node {
        id: my_id,
        address: "127.0.0.1".to_string(),
        port: 7000,
        slots: (0..8192).collect(),
        flags: NodeFlags::MYSELF | NodeFlags::MASTER,
    });
    cluster.add_node(Node {
        id: other_id,
        address: "127.0.0.1".to_string(),
        port: 7001,
        slots: (8192..16383).collect(), // slot 16383 deliberately unassigned
        flags: NodeFlags::MASTER,
    });
    cluster
}

#[test]
fn test_key_ownership_local_remote_and_unassigned() {
    let cluster = two_node_cluster();

    // Find one key per ownership class.
    let mut local = None;
    let mut remote = None;
    for i in 0..100_000u32 {
        let key = format!("probe:{i}");
        match key_hash_slot(key.as_bytes()) {
            slot if slot < 8192 && local.is_none() => local = Some(key),
            slot if (8192..16383).contains(&slot) && remote.is_none() => remote = Some(key),
            _ => {}
        }
        if local.is_some() && remote.is_some() {
            break;
        }
    }

    let local = local.unwrap();
    assert!(cluster.check_key_ownership(local.as_bytes(), false, true).is_ok());

    let remote = remote.unwrap();
    match cluster.check_key_ownership(remote.as_bytes(), false, true) {
        Err(JasperError::Moved { slot, addr }) => {
            assert_eq!(slot, key_hash_slot(remote.as_bytes()));
            assert_eq!(addr, "127.0.0.1:7001");
        }
        other => panic!("expected MOVED, got {other:?}"),
    }
}

#[test]
fn test_unassigned_slot_is_cluster_down() {
    let cluster = two_node_cluster();
    // Hunt for a key hashing to the one unassigned slot.
    for i in 0..1_000_000u32 {
        let key = format!("hunt:{i}");
        if key_hash_slot(key.as_bytes()) == 16383 {
            assert!(matches!(
                cluster.check_key_ownership(key.as_bytes(), false, true),
                Err(JasperError::ClusterDown(_))
            ));
            return;
        }
    }
    panic!("no key hashing to slot 16383 found");
}

#[test]
fn test_cross_slot_multi_key_commands_rejected() {
    let cluster = two_node_cluster();
    let keys = [Bytes::from_static(b"{a}one"), Bytes::from_static(b"{b}two")];
    if !keys_in_same_slot(&keys) {
        assert!(matches!(
            cluster.check_multi_key_ownership(&keys, false, true),
            Err(JasperError::CrossSlot)
        ));
    }
    // Same-tag keys never cross-slot.
    let same = [Bytes::from_static(b"{a}one"), Bytes::from_static(b"{a}two")];
    assert!(!matches!(
        cluster.check_multi_key_ownership(&same, false, true),
        Err(JasperError::CrossSlot)
    ));
}

#[test]
fn test_ownership_disabled_when_cluster_off() {
    let cluster = ClusterState::new(false, "x".repeat(40));
    assert!(cluster.check_key_ownership(b"anything", false, true).is_ok());
}

/// Finds a key hashing into a locally owned slot of `two_node_cluster`.
fn local_key(cluster: &ClusterState) -> (String, u16) {
    for i in 0..100_000u32 {
        let key = format!("mig:{i}");
        let slot = key_hash_slot(key.as_bytes());
        if cluster.i_own_slot(slot) {
            return (key, slot);
        }
    }
    panic!("no locally owned key found");
}

#[test]
fn test_migrating_slot_asks_for_moved_out_keys() {
    let cluster = two_node_cluster();
    let other_id = "b".repeat(40);
    let (key, slot) = local_key(&cluster);

    cluster.set_slot_migrating(slot, &other_id).unwrap();

    // Keys still present locally are served as usual.
    assert!(cluster.check_key_ownership(key.as_bytes(), false, true).is_ok());

    // A key that has already moved out redirects with ASK to the target.
    match cluster.check_key_ownership(key.as_bytes(), false, false) {
        Err(JasperError::Ask { slot: ask_slot, addr }) => {
            assert_eq!(ask_slot, slot);
            assert_eq!(addr, "127.0.0.1:7001");
        }
        other => panic!("expected ASK, got {other:?}"),
    }

    // SETSLOT STABLE drops the redirect again.
    cluster.clear_slot_migration(slot);
    assert!(cluster.check_key_ownership(key.as_bytes(), false, false).is_ok());
}

#[test]
fn test_migrating_requires_slot_ownership() {
    let cluster = two_node_cluster();
    // Slot 16383 is unassigned in this topology.
    assert!(cluster.set_slot_migrating(16383, "b".repeat(40).as_str()).is_err());
}

#[test]
fn test_importing_slot_served_only_to_asking_clients() {
    let cluster = two_node_cluster();
    let other_id = "b".repeat(40);

    // Find a key in a slot the *other* node owns.
    let (key, slot) = (0..100_000u32)
        .map(|i| format!("imp:{i}"))
        .find_map(|key| {
            let slot = key_hash_slot(key.as_bytes());
            (cluster.owner_of(slot).as_deref() == Some(other_id.as_str()))
                .then_some((key, slot))
        })
        .unwrap();

    cluster.set_slot_importing(slot, &other_id);

    // Without ASKING the client is pointed back at the official owner.
    assert!(matches!(
        cluster.check_key_ownership(key.as_bytes(), false, false),
        Err(JasperError::Moved { .. })
    ));

    // With the one-shot ASKING announcement the command is served here.
    assert!(cluster.check_key_ownership(key.as_bytes(), true, false).is_ok());
}

#[test]
fn test_finalize_slot_owner_transfers_and_clears_flags() {
    let cluster = two_node_cluster();
    let other_id = "b".repeat(40);
    let (key, slot) = local_key(&cluster);

    cluster.set_slot_migrating(slot, &other_id).unwrap();
    cluster.finalize_slot_owner(slot, &other_id).unwrap();

    assert_eq!(cluster.owner_of(slot).as_deref(), Some(other_id.as_str()));
    // The migration flag is gone, so the redirect is a plain MOVED now.
    assert!(matches!(
        cluster.check_key_ownership(key.as_bytes(), false, false),
        Err(JasperError::Moved { .. })
    ));

    // Finalizing onto an unknown node is refused.
    assert!(cluster.finalize_slot_owner(slot, "nobody").is_err());
}
