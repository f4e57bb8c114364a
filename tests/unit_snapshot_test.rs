use bytes::{Bytes, BytesMut};
use jasperdb::core::JasperError;
use jasperdb::core::persistence::snapshot::{
    self, SnapshotReader, read_length, write_length,
};
use jasperdb::core::storage::data_types::{DataValue, StoredValue};
use jasperdb::core::storage::db::Db;
use indexmap::IndexMap;
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

fn sample_db() -> Db {
    let db = Db::new();
    db.set(
        Bytes::from_static(b"greeting"),
        StoredValue::new(DataValue::String(Bytes::from_static(b"hello"))),
    );

    let mut list = VecDeque::new();
    list.push_back(Bytes::from_static(b"a"));
    list.push_back(Bytes::from_static(b"b"));
    list.push_back(Bytes::from_static(b"c"));
    db.set(Bytes::from_static(b"mylist"), StoredValue::new(DataValue::List(list)));

    let mut set = HashSet::new();
    set.insert(Bytes::from_static(b"one"));
    set.insert(Bytes::from_static(b"two"));
    db.set(Bytes::from_static(b"myset"), StoredValue::new(DataValue::Set(set)));

    let mut hash = IndexMap::new();
    hash.insert(Bytes::from_static(b"field"), Bytes::from_static(b"value"));
    hash.insert(Bytes::from_static(b"other"), Bytes::from_static(b"thing"));
    db.set(Bytes::from_static(b"myhash"), StoredValue::new(DataValue::Hash(hash)));

    let mut expiring = StoredValue::new(DataValue::String(Bytes::from_static(b"soon")));
    expiring.expiry = Some(Instant::now() + Duration::from_secs(3600));
    db.set(Bytes::from_static(b"volatile"), expiring);

    db
}

#[test]
fn test_snapshot_header_layout() {
    let bytes = snapshot::save_to_bytes(&Db::new()).unwrap();
    assert_eq!(&bytes[0..5], b"REDIS");
    assert_eq!(&bytes[5..9], b"0009");
    // The file ends with the EOF opcode followed by the 8-byte checksum.
    assert_eq!(bytes[bytes.len() - 9], 0xFF);
}

#[tokio::test]
async fn test_snapshot_round_trip() {
    let db = sample_db();
    let bytes = snapshot::save_to_bytes(&db).unwrap();

    let restored = Db::new();
    let reader = SnapshotReader::from_bytes(bytes).unwrap();
    for record in reader {
        let record = record.unwrap();
        restored.insert_from_load(record.key, StoredValue::new(record.value));
    }

    assert_eq!(restored.len(), 5);
    let greeting = restored.get(&Bytes::from_static(b"greeting")).unwrap();
    assert_eq!(greeting.data, DataValue::String(Bytes::from_static(b"hello")));

    let list = restored.get(&Bytes::from_static(b"mylist")).unwrap();
    match list.data {
        DataValue::List(items) => {
            assert_eq!(items, VecDeque::from(vec![
                Bytes::from_static(b"a"),
                Bytes::from_static(b"b"),
                Bytes::from_static(b"c"),
            ]));
        }
        other => panic!("expected list, got {other:?}"),
    }

    let hash = restored.get(&Bytes::from_static(b"myhash")).unwrap();
    match hash.data {
        DataValue::Hash(fields) => {
            assert_eq!(fields.get(&Bytes::from_static(b"field")), Some(&Bytes::from_static(b"value")));
            assert_eq!(fields.len(), 2);
        }
        other => panic!("expected hash, got {other:?}"),
    }
}

#[test]
fn test_expiring_key_carries_expiry_record() {
    let db = sample_db();
    let bytes = snapshot::save_to_bytes(&db).unwrap();
    let reader = SnapshotReader::from_bytes(bytes).unwrap();

    let mut saw_volatile_expiry = false;
    for record in reader {
        let record = record.unwrap();
        if record.key == Bytes::from_static(b"volatile") {
            let expiry_ms = record.expiry_ms.expect("volatile key must carry expiry");
            // Roughly one hour in the future, expressed as unix millis.
            let now_ms = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_millis() as u64;
            assert!(expiry_ms > now_ms + 3_000_000);
            saw_volatile_expiry = true;
        } else {
            assert!(record.expiry_ms.is_none());
        }
    }
    assert!(saw_volatile_expiry);
}

#[test]
fn test_crc_tamper_is_rejected() {
    let db = sample_db();
    let bytes = snapshot::save_to_bytes(&db).unwrap();

    // Flip one byte in the body; the reader must refuse the whole file.
    for position in [5, 10, bytes.len() / 2, bytes.len() - 10] {
        let mut tampered = bytes.to_vec();
        tampered[position] ^= 0x01;
        let result = SnapshotReader::from_bytes(Bytes::from(tampered));
        assert!(
            matches!(result, Err(JasperError::SnapshotCorrupt(_))),
            "tamper at {position} was not caught"
        );
    }
}

#[test]
fn test_bad_magic_and_version_are_rejected() {
    // A structurally valid checksum over a bogus header still fails the
    // magic check.
    let mut body = BytesMut::new();
    body.extend_from_slice(b"NOPE!0009\xFF");
    let crc = crc::Crc::<u64>::new(&crc::CRC_64_ECMA_182).checksum(&body);
    let mut file = body.to_vec();
    file.extend_from_slice(&crc.to_le_bytes());
    assert!(matches!(
        SnapshotReader::from_bytes(Bytes::from(file)),
        Err(JasperError::SnapshotCorrupt(_))
    ));
}

#[tokio::test]
async fn test_save_and_load_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dump.snap");
    let path = path.to_str().unwrap();

    let db = sample_db();
    snapshot::save(&db, path).await.unwrap();

    let restored = Db::new();
    let loaded = snapshot::load(path, &restored).await.unwrap();
    assert_eq!(loaded, 5);
    assert_eq!(restored.len(), 5);
}

#[tokio::test]
async fn test_load_missing_file_starts_empty() {
    let db = Db::new();
    let loaded = snapshot::load("/nonexistent/path/dump.snap", &db).await.unwrap();
    assert_eq!(loaded, 0);
    assert!(db.is_empty());
}

#[test]
fn test_length_encoding_round_trip() {
    for len in [0u64, 1, 63, 64, 100, 16383, 16384, 1_000_000, u32::MAX as u64] {
        let mut buf = BytesMut::new();
        write_length(&mut buf, len);
        let mut cursor = buf.freeze();
        assert_eq!(read_length(&mut cursor).unwrap(), len, "length {len}");
        assert!(cursor.is_empty());
    }
}

#[test]
fn test_length_encoding_widths() {
    let mut buf = BytesMut::new();
    write_length(&mut buf, 10);
    assert_eq!(buf.len(), 1);

    let mut buf = BytesMut::new();
    write_length(&mut buf, 1000);
    assert_eq!(buf.len(), 2);
    assert_eq!(buf[0] & 0xC0, 0x40);

    let mut buf = BytesMut::new();
    write_length(&mut buf, 100_000);
    assert_eq!(buf.len(), 5);
    assert_eq!(buf[0], 0x80);
}
