use bytes::Bytes;
use jasperdb::client::{ClientConfig, SentinelAwareClient, parse_replicas_reply};
use jasperdb::core::protocol::RespFrame;
use jasperdb::core::sentinel::client::parse_addr_reply;
use std::time::Duration;

fn bulk(s: &str) -> RespFrame {
    RespFrame::BulkString(Bytes::from(s.to_string()))
}

#[test]
fn test_parse_replicas_reply_extracts_addresses() {
    // The nested-array shape actually returned by SENTINEL REPLICAS: one
    // flat field/value array per replica.
    let reply = RespFrame::Array(vec![
        RespFrame::Array(vec![
            bulk("name"),
            bulk("127.0.0.1:6380"),
            bulk("ip"),
            bulk("127.0.0.1"),
            bulk("port"),
            bulk("6380"),
            bulk("flags"),
            bulk("slave"),
        ]),
        RespFrame::Array(vec![
            bulk("ip"),
            bulk("127.0.0.1"),
            bulk("port"),
            RespFrame::Integer(6381),
        ]),
    ]);

    let replicas = parse_replicas_reply(&reply);
    assert_eq!(
        replicas,
        vec![
            ("127.0.0.1".to_string(), 6380),
            ("127.0.0.1".to_string(), 6381),
        ]
    );
}

#[test]
fn test_parse_replicas_reply_skips_malformed_entries() {
    let reply = RespFrame::Array(vec![
        // Missing port.
        RespFrame::Array(vec![bulk("ip"), bulk("10.0.0.1")]),
        // Not an array at all.
        RespFrame::Integer(42),
        // Valid.
        RespFrame::Array(vec![bulk("ip"), bulk("10.0.0.2"), bulk("port"), bulk("7000")]),
    ]);
    assert_eq!(parse_replicas_reply(&reply), vec![("10.0.0.2".to_string(), 7000)]);
}

#[test]
fn test_parse_replicas_reply_empty_cases() {
    assert!(parse_replicas_reply(&RespFrame::Array(vec![])).is_empty());
    assert!(parse_replicas_reply(&RespFrame::Null).is_empty());
}

#[test]
fn test_parse_addr_reply_variants() {
    // Bulk-string port.
    let reply = RespFrame::Array(vec![bulk("127.0.0.1"), bulk("6379")]);
    assert_eq!(
        parse_addr_reply(reply).unwrap(),
        Some(("127.0.0.1".to_string(), 6379))
    );

    // Integer port, as some implementations encode it.
    let reply = RespFrame::Array(vec![bulk("10.0.0.5"), RespFrame::Integer(6380)]);
    assert_eq!(
        parse_addr_reply(reply).unwrap(),
        Some(("10.0.0.5".to_string(), 6380))
    );

    // Unknown master.
    assert_eq!(parse_addr_reply(RespFrame::Null).unwrap(), None);
    assert_eq!(parse_addr_reply(RespFrame::NullArray).unwrap(), None);

    // Garbage.
    assert!(parse_addr_reply(RespFrame::Integer(3)).is_err());
}

#[tokio::test]
async fn test_client_requires_sentinels_and_master_name() {
    let no_sentinels = ClientConfig {
        sentinel_addrs: vec![],
        master_name: "mymaster".to_string(),
        health_check_interval: Duration::ZERO,
        require_strong_consistency: false,
    };
    assert!(SentinelAwareClient::connect(no_sentinels).await.is_err());

    let no_name = ClientConfig {
        sentinel_addrs: vec!["127.0.0.1:26379".to_string()],
        master_name: String::new(),
        health_check_interval: Duration::ZERO,
        require_strong_consistency: false,
    };
    assert!(SentinelAwareClient::connect(no_name).await.is_err());
}
