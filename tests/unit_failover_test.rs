use jasperdb::core::sentinel::failover::select_best_replica;
use jasperdb::core::sentinel::state::{InstanceRole, MonitoredInstance};
use std::collections::BTreeMap;
use std::time::Instant;

fn replica(port: u16, priority: u32, offset: u64, down: bool) -> MonitoredInstance {
    let mut instance =
        MonitoredInstance::new("127.0.0.1".to_string(), port, InstanceRole::Replica);
    instance.priority = priority;
    instance.repl_offset = offset;
    if down {
        instance.down_flag = true;
        instance.down_since = Some(Instant::now());
    }
    instance
}

fn pool(replicas: Vec<MonitoredInstance>) -> BTreeMap<String, MonitoredInstance> {
    replicas.into_iter().map(|r| (r.addr(), r)).collect()
}

#[test]
fn test_higher_offset_wins_within_priority_class() {
    let replicas = pool(vec![
        replica(6380, 100, 500, false),
        replica(6381, 100, 700, false),
    ]);
    let winner = select_best_replica(&replicas).unwrap();
    assert_eq!(winner.port, 6381);
}

#[test]
fn test_priority_dominates_offset() {
    // Priority is weighted a million times the offset; a higher-priority
    // replica wins even when it lags.
    let replicas = pool(vec![
        replica(6380, 200, 0, false),
        replica(6381, 100, 999_999, false),
    ]);
    let winner = select_best_replica(&replicas).unwrap();
    assert_eq!(winner.port, 6380);
}

#[test]
fn test_down_replicas_are_excluded() {
    let replicas = pool(vec![
        replica(6380, 100, 900, true),
        replica(6381, 100, 100, false),
    ]);
    let winner = select_best_replica(&replicas).unwrap();
    assert_eq!(winner.port, 6381);
}

#[test]
fn test_selection_empty_iff_all_replicas_down() {
    assert!(select_best_replica(&BTreeMap::new()).is_none());

    let all_down = pool(vec![
        replica(6380, 100, 500, true),
        replica(6381, 100, 700, true),
    ]);
    assert!(select_best_replica(&all_down).is_none());

    let one_up = pool(vec![
        replica(6380, 100, 500, true),
        replica(6381, 100, 700, false),
    ]);
    assert!(select_best_replica(&one_up).is_some());
}

#[test]
fn test_exact_score_tie_breaks_lexicographically() {
    let replicas = pool(vec![
        replica(6381, 100, 500, false),
        replica(6380, 100, 500, false),
    ]);
    let winner = select_best_replica(&replicas).unwrap();
    // "127.0.0.1:6380" sorts before "127.0.0.1:6381".
    assert_eq!(winner.port, 6380);
}

#[test]
fn test_zero_priority_replica_still_eligible() {
    // Priority 0 scores below any non-zero priority but remains a valid
    // candidate when it is the only replica left.
    let replicas = pool(vec![replica(6380, 0, 12345, false)]);
    let winner = select_best_replica(&replicas).unwrap();
    assert_eq!(winner.port, 6380);

    let mixed = pool(vec![
        replica(6380, 0, 999_999, false),
        replica(6381, 1, 0, false),
    ]);
    assert_eq!(select_best_replica(&mixed).unwrap().port, 6381);
}
