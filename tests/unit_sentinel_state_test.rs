use jasperdb::core::sentinel::monitor::{parse_replica_lines, random_election_timeout};
use jasperdb::core::sentinel::state::{InstanceRole, MonitoredInstance};
use std::time::{Duration, Instant};

#[test]
fn test_probe_bookkeeping_invariants() {
    let mut instance =
        MonitoredInstance::new("127.0.0.1".to_string(), 6379, InstanceRole::Master);
    assert!(!instance.down_flag);
    assert!(instance.down_since.is_none());

    instance.mark_probe(false);
    // down_flag implies down_since is set and not in the future.
    assert!(instance.down_flag);
    let since = instance.down_since.unwrap();
    assert!(since <= Instant::now());
    assert!(!instance.last_probe_ok);

    // Further failures keep the original down_since.
    instance.mark_probe(false);
    assert_eq!(instance.down_since.unwrap(), since);

    // Recovery clears both.
    instance.mark_probe(true);
    assert!(!instance.down_flag);
    assert!(instance.down_since.is_none());
    assert!(instance.last_probe_ok);
}

#[test]
fn test_sdown_requires_down_after_to_elapse() {
    let down_after = Duration::from_millis(200);
    let mut instance =
        MonitoredInstance::new("127.0.0.1".to_string(), 6379, InstanceRole::Master);

    instance.mark_probe(false);
    // Freshly down is not yet SDOWN.
    assert!(!instance.is_sdown(down_after));

    // Backdate the failure past the threshold.
    instance.down_since = Some(Instant::now() - Duration::from_millis(500));
    assert!(instance.is_sdown(down_after));

    // A healthy instance is never SDOWN regardless of history.
    instance.mark_probe(true);
    assert!(!instance.is_sdown(down_after));
}

#[test]
fn test_election_timeout_stays_in_range() {
    let down_after = Duration::from_millis(2000);
    for _ in 0..200 {
        let timeout = random_election_timeout(down_after);
        assert!(timeout >= down_after, "timeout below down_after");
        assert!(timeout <= down_after * 2, "timeout above 2x down_after");
    }
}

#[test]
fn test_election_timeouts_are_actually_randomized() {
    let down_after = Duration::from_millis(10_000);
    let first = random_election_timeout(down_after);
    let distinct = (0..50).any(|_| random_election_timeout(down_after) != first);
    assert!(distinct, "200 draws produced a single value");
}

#[test]
fn test_parse_replica_lines_from_info() {
    let info = "# Replication\r\n\
        role:master\r\n\
        master_replid:abcdef0123456789\r\n\
        master_repl_offset:700\r\n\
        connected_slaves:2\r\n\
        slave0:ip=127.0.0.1,port=6380,state=online,offset=500,priority=100\r\n\
        slave1:ip=127.0.0.1,port=6381,state=online,offset=700,priority=100\r\n";

    let lines = parse_replica_lines(info);
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0].host, "127.0.0.1");
    assert_eq!(lines[0].port, 6380);
    assert_eq!(lines[0].offset, 500);
    assert_eq!(lines[0].priority, 100);
    assert!(lines[0].online);
    assert_eq!(lines[1].port, 6381);
    assert_eq!(lines[1].offset, 700);
}

#[test]
fn test_parse_replica_lines_ignores_non_replica_slave_fields() {
    // slave_repl_offset is a scalar field on replicas, not a replica entry.
    let info = "role:slave\r\nslave_repl_offset:123\r\nslave_priority:90\r\n";
    assert!(parse_replica_lines(info).is_empty());
}

#[test]
fn test_parse_replica_lines_defaults_missing_priority() {
    let info = "slave0:ip=10.0.0.5,port=7000,state=online,offset=42\r\n";
    let lines = parse_replica_lines(info);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].priority, 100);
    assert_eq!(lines[0].offset, 42);
}
