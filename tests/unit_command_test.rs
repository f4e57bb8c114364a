use bytes::Bytes;
use jasperdb::core::JasperError;
use jasperdb::core::commands::{ClusterSubcommand, Command, SlotMigrationAction};
use std::time::Duration;

fn args(parts: &[&str]) -> Vec<Bytes> {
    parts.iter().map(|p| Bytes::from(p.to_string())).collect()
}

#[test]
fn test_set_parse_basic() {
    let cmd = Command::parse(&args(&["SET", "mykey", "myvalue"])).unwrap();
    assert_eq!(
        cmd,
        Command::Set {
            key: Bytes::from_static(b"mykey"),
            value: Bytes::from_static(b"myvalue"),
            ttl: None,
        }
    );
}

#[test]
fn test_set_parse_with_ex() {
    let cmd = Command::parse(&args(&["SET", "k", "v", "EX", "3600"])).unwrap();
    let Command::Set { ttl, .. } = cmd else {
        panic!("expected SET");
    };
    assert_eq!(ttl, Some(Duration::from_secs(3600)));
}

#[test]
fn test_set_parse_with_px() {
    let cmd = Command::parse(&args(&["set", "k", "v", "px", "90000"])).unwrap();
    let Command::Set { ttl, .. } = cmd else {
        panic!("expected SET");
    };
    assert_eq!(ttl, Some(Duration::from_millis(90000)));
}

#[test]
fn test_set_rejects_unknown_option() {
    assert!(matches!(
        Command::parse(&args(&["SET", "k", "v", "BOGUS"])),
        Err(JasperError::SyntaxError)
    ));
}

#[test]
fn test_command_names_are_case_insensitive() {
    assert!(Command::parse(&args(&["get", "k"])).is_ok());
    assert!(Command::parse(&args(&["GeT", "k"])).is_ok());
    assert!(Command::parse(&args(&["PING"])).is_ok());
}

#[test]
fn test_unknown_command_error_carries_name() {
    match Command::parse(&args(&["FROBNICATE", "x"])) {
        Err(JasperError::UnknownCommand(name)) => assert_eq!(name, "FROBNICATE"),
        other => panic!("expected UnknownCommand, got {other:?}"),
    }
}

#[test]
fn test_wrong_arity_is_rejected() {
    assert!(matches!(
        Command::parse(&args(&["GET"])),
        Err(JasperError::WrongArgumentCount(_))
    ));
    assert!(matches!(
        Command::parse(&args(&["HSET", "key", "field"])),
        Err(JasperError::WrongArgumentCount(_))
    ));
    assert!(matches!(
        Command::parse(&args(&["EXPIRE", "key"])),
        Err(JasperError::WrongArgumentCount(_))
    ));
}

#[test]
fn test_replicaof_parse() {
    let cmd = Command::parse(&args(&["REPLICAOF", "127.0.0.1", "6379"])).unwrap();
    assert_eq!(
        cmd,
        Command::ReplicaOf {
            target: Some(("127.0.0.1".to_string(), 6379)),
        }
    );

    let cmd = Command::parse(&args(&["REPLICAOF", "NO", "ONE"])).unwrap();
    assert_eq!(cmd, Command::ReplicaOf { target: None });

    // Case-insensitive NO ONE, and SLAVEOF as an alias.
    let cmd = Command::parse(&args(&["SLAVEOF", "no", "one"])).unwrap();
    assert_eq!(cmd, Command::ReplicaOf { target: None });
}

#[test]
fn test_psync_and_replconf_parse() {
    let cmd = Command::parse(&args(&["PSYNC", "?", "-1"])).unwrap();
    assert_eq!(
        cmd,
        Command::Psync {
            replid: "?".to_string(),
            offset: "-1".to_string(),
        }
    );

    let cmd = Command::parse(&args(&["REPLCONF", "listening-port", "6380"])).unwrap();
    assert_eq!(
        cmd,
        Command::ReplConf {
            pairs: vec![("listening-port".to_string(), "6380".to_string())],
        }
    );
}

#[test]
fn test_cluster_subcommands() {
    assert_eq!(
        Command::parse(&args(&["CLUSTER", "SLOTS"])).unwrap(),
        Command::Cluster(ClusterSubcommand::Slots)
    );
    assert_eq!(
        Command::parse(&args(&["CLUSTER", "info"])).unwrap(),
        Command::Cluster(ClusterSubcommand::Info)
    );
    assert!(Command::parse(&args(&["CLUSTER", "RESHARD"])).is_err());
}

#[test]
fn test_asking_parse() {
    let cmd = Command::parse(&args(&["ASKING"])).unwrap();
    assert_eq!(cmd, Command::Asking);
    assert!(!cmd.is_write());
    assert!(cmd.keys().is_empty());
    assert!(Command::parse(&args(&["ASKING", "extra"])).is_err());
}

#[test]
fn test_cluster_setslot_parse() {
    let node = "b".repeat(40);
    assert_eq!(
        Command::parse(&args(&["CLUSTER", "SETSLOT", "100", "MIGRATING", &node])).unwrap(),
        Command::Cluster(ClusterSubcommand::SetSlot {
            slot: 100,
            action: SlotMigrationAction::Migrating(node.clone()),
        })
    );
    assert_eq!(
        Command::parse(&args(&["CLUSTER", "setslot", "7", "importing", &node])).unwrap(),
        Command::Cluster(ClusterSubcommand::SetSlot {
            slot: 7,
            action: SlotMigrationAction::Importing(node.clone()),
        })
    );
    assert_eq!(
        Command::parse(&args(&["CLUSTER", "SETSLOT", "7", "STABLE"])).unwrap(),
        Command::Cluster(ClusterSubcommand::SetSlot {
            slot: 7,
            action: SlotMigrationAction::Stable,
        })
    );
    assert_eq!(
        Command::parse(&args(&["CLUSTER", "SETSLOT", "7", "NODE", &node])).unwrap(),
        Command::Cluster(ClusterSubcommand::SetSlot {
            slot: 7,
            action: SlotMigrationAction::Node(node),
        })
    );

    // Out-of-range slots, missing node arguments, and unknown actions fail.
    assert!(Command::parse(&args(&["CLUSTER", "SETSLOT", "16384", "STABLE"])).is_err());
    assert!(Command::parse(&args(&["CLUSTER", "SETSLOT", "7", "MIGRATING"])).is_err());
    assert!(Command::parse(&args(&["CLUSTER", "SETSLOT", "7", "SIDEWAYS"])).is_err());
}

#[test]
fn test_is_write_classification() {
    let writes = [
        args(&["SET", "k", "v"]),
        args(&["DEL", "k"]),
        args(&["EXPIRE", "k", "10"]),
        args(&["HSET", "k", "f", "v"]),
        args(&["LPUSH", "k", "v"]),
        args(&["SADD", "k", "m"]),
    ];
    for raw in &writes {
        assert!(Command::parse(raw).unwrap().is_write(), "{raw:?}");
    }

    let reads = [
        args(&["GET", "k"]),
        args(&["EXISTS", "k"]),
        args(&["TTL", "k"]),
        args(&["LRANGE", "k", "0", "-1"]),
        args(&["SMEMBERS", "k"]),
        args(&["INFO"]),
        args(&["PING"]),
    ];
    for raw in &reads {
        assert!(!Command::parse(raw).unwrap().is_write(), "{raw:?}");
    }
}

#[test]
fn test_keys_extraction_for_multi_key_commands() {
    let cmd = Command::parse(&args(&["DEL", "a", "b", "c"])).unwrap();
    assert_eq!(
        cmd.keys(),
        vec![
            Bytes::from_static(b"a"),
            Bytes::from_static(b"b"),
            Bytes::from_static(b"c"),
        ]
    );

    let cmd = Command::parse(&args(&["PING"])).unwrap();
    assert!(cmd.keys().is_empty());
}
