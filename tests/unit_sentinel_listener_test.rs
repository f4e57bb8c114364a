use bytes::{Bytes, BytesMut};
use jasperdb::core::protocol::{RespFrame, RespFrameCodec};
use jasperdb::core::sentinel::SentinelConfig;
use jasperdb::core::sentinel::listener::process_command;
use jasperdb::core::sentinel::state::{InstanceRole, MonitoredInstance, SentinelState};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::codec::Encoder;

fn test_state() -> Arc<SentinelState> {
    let config = SentinelConfig {
        host: "127.0.0.1".to_string(),
        port: 26379,
        master_name: "mymaster".to_string(),
        master_host: "127.0.0.1".to_string(),
        master_port: 6379,
        quorum: 2,
        down_after: Duration::from_millis(2000),
        failover_timeout: Duration::from_millis(180_000),
        sentinel_addrs: vec![],
        max_connections: 10_000,
    };
    SentinelState::new(config, None)
}

fn args(parts: &[&str]) -> Vec<Bytes> {
    parts.iter().map(|p| Bytes::from(p.to_string())).collect()
}

fn mark_master_sdown(state: &SentinelState) {
    let mut master = state.master.lock();
    master.mark_probe(false);
    master.down_since = Some(Instant::now() - Duration::from_secs(60));
}

fn encode(frame: RespFrame) -> Vec<u8> {
    let mut buf = BytesMut::new();
    RespFrameCodec.encode(frame, &mut buf).unwrap();
    buf.to_vec()
}

#[test]
fn test_ping_replies_pong() {
    let state = test_state();
    let reply = process_command(&args(&["PING"]), &state);
    assert_eq!(reply, RespFrame::SimpleString("PONG".to_string()));
}

#[test]
fn test_unknown_command_is_rejected() {
    let state = test_state();
    let reply = process_command(&args(&["FLUSHALL"]), &state);
    let RespFrame::Error(e) = reply else {
        panic!("expected error reply");
    };
    assert!(e.starts_with("ERR unknown command"));
}

#[test]
fn test_get_master_addr_by_name() {
    let state = test_state();
    let reply = process_command(
        &args(&["SENTINEL", "GET-MASTER-ADDR-BY-NAME", "mymaster"]),
        &state,
    );
    assert_eq!(
        reply,
        RespFrame::Array(vec![
            RespFrame::BulkString(Bytes::from_static(b"127.0.0.1")),
            RespFrame::BulkString(Bytes::from_static(b"6379")),
        ])
    );

    // Unknown master names yield the null array.
    let reply = process_command(
        &args(&["SENTINEL", "GET-MASTER-ADDR-BY-NAME", "nope"]),
        &state,
    );
    assert_eq!(reply, RespFrame::NullArray);
}

#[test]
fn test_vote_granted_when_master_down_exact_bytes() {
    let state = test_state();
    mark_master_sdown(&state);

    let reply = process_command(
        &args(&[
            "SENTINEL",
            "IS-MASTER-DOWN-BY-ADDR",
            "127.0.0.1",
            "6379",
            "5",
            "10.0.0.1:26379",
        ]),
        &state,
    );

    // The reply is the exact three-element array [agrees, leader, epoch].
    assert_eq!(
        encode(reply),
        b"*3\r\n:1\r\n$14\r\n10.0.0.1:26379\r\n:5\r\n"
    );
}

#[test]
fn test_vote_rejected_when_master_up_uses_null_leader() {
    let state = test_state();
    // Master was never marked down; the vote must be refused without voting.
    let reply = process_command(
        &args(&[
            "SENTINEL",
            "IS-MASTER-DOWN-BY-ADDR",
            "127.0.0.1",
            "6379",
            "5",
            "10.0.0.1:26379",
        ]),
        &state,
    );
    assert_eq!(encode(reply), b"*3\r\n:0\r\n$-1\r\n:5\r\n");
}

#[test]
fn test_vote_rejected_for_mismatched_master_addr() {
    let state = test_state();
    mark_master_sdown(&state);

    let reply = process_command(
        &args(&[
            "SENTINEL",
            "IS-MASTER-DOWN-BY-ADDR",
            "10.9.9.9",
            "7000",
            "5",
            "10.0.0.1:26379",
        ]),
        &state,
    );
    let RespFrame::Array(items) = reply else {
        panic!("expected array reply");
    };
    assert_eq!(items[0], RespFrame::Integer(0));
}

#[test]
fn test_second_candidate_same_epoch_sees_first_leader() {
    let state = test_state();
    mark_master_sdown(&state);

    let grant = process_command(
        &args(&[
            "SENTINEL",
            "IS-MASTER-DOWN-BY-ADDR",
            "127.0.0.1",
            "6379",
            "7",
            "A:26379",
        ]),
        &state,
    );
    assert_eq!(encode(grant), b"*3\r\n:1\r\n$7\r\nA:26379\r\n:7\r\n");

    let reject = process_command(
        &args(&[
            "SENTINEL",
            "IS-MASTER-DOWN-BY-ADDR",
            "127.0.0.1",
            "6379",
            "7",
            "B:26379",
        ]),
        &state,
    );
    assert_eq!(encode(reject), b"*3\r\n:0\r\n$7\r\nA:26379\r\n:7\r\n");
}

#[test]
fn test_sentinel_replicas_reports_offsets_and_priorities() {
    let state = test_state();
    {
        let mut replicas = state.replicas.lock();
        let mut replica =
            MonitoredInstance::new("127.0.0.1".to_string(), 6380, InstanceRole::Replica);
        replica.repl_offset = 500;
        replica.priority = 90;
        replicas.insert(replica.addr(), replica);
    }

    let reply = process_command(&args(&["SENTINEL", "REPLICAS", "mymaster"]), &state);
    let parsed = jasperdb::client::parse_replicas_reply(&reply);
    assert_eq!(parsed, vec![("127.0.0.1".to_string(), 6380)]);
}

#[test]
fn test_sentinel_masters_lists_the_monitored_master() {
    let state = test_state();
    let reply = process_command(&args(&["SENTINEL", "MASTERS"]), &state);
    let RespFrame::Array(masters) = reply else {
        panic!("expected array");
    };
    assert_eq!(masters.len(), 1);
    let RespFrame::Array(fields) = &masters[0] else {
        panic!("expected flat field array");
    };
    // Field names and values alternate.
    assert!(fields.len() % 2 == 0);
    assert!(fields.contains(&RespFrame::BulkString(Bytes::from_static(b"mymaster"))));
}

#[test]
fn test_sentinel_reset_acknowledges_and_clears_vote() {
    let state = test_state();
    mark_master_sdown(&state);
    process_command(
        &args(&[
            "SENTINEL",
            "IS-MASTER-DOWN-BY-ADDR",
            "127.0.0.1",
            "6379",
            "3",
            "A:26379",
        ]),
        &state,
    );
    assert_eq!(state.voting.lock().voted_epoch, 3);

    let reply = process_command(&args(&["SENTINEL", "RESET", "*"]), &state);
    assert_eq!(reply, RespFrame::Integer(1));
    assert_eq!(state.voting.lock().voted_epoch, 0);
    assert!(state.voting.lock().voted_for.is_none());
}
