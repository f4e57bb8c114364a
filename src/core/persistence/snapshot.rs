// src/core/persistence/snapshot.rs

//! Implements the binary snapshot format for point-in-time persistence.
//!
//! A snapshot file is laid out as: the magic `REDIS` and a 4-digit ASCII
//! version, aux fields, a SELECT-DB marker, a resize hint with the key and
//! expiring-key counts, one record per key (optionally prefixed with a
//! millisecond expiry), an EOF opcode, and a little-endian CRC64 trailer over
//! everything before it. The writer builds the whole image in memory, writes
//! it to a temp file, fsyncs, and atomically renames over the target.

use crate::core::JasperError;
use crate::core::storage::data_types::{DataValue, StoredValue};
use crate::core::storage::db::Db;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{CRC_64_ECMA_182, Crc};
use indexmap::IndexMap;
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

// --- Snapshot format constants ---
const SNAPSHOT_MAGIC: &[u8] = b"REDIS";
const SNAPSHOT_VERSION: &[u8] = b"0009";

const OPCODE_AUX: u8 = 0xFA;
const OPCODE_RESIZEDB: u8 = 0xFB;
const OPCODE_EXPIRETIME_MS: u8 = 0xFC;
const OPCODE_SELECTDB: u8 = 0xFE;
const OPCODE_EOF: u8 = 0xFF;

const TYPE_STRING: u8 = 0;
const TYPE_LIST: u8 = 1;
const TYPE_SET: u8 = 2;
/// Reserved for wire compatibility; the writer never emits it.
const TYPE_ZSET: u8 = 3;
const TYPE_HASH: u8 = 4;

const CHECKSUM_ALGO: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// One key's worth of snapshot data.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRecord {
    pub key: Bytes,
    /// Absolute expiry as milliseconds since the Unix epoch, if any.
    pub expiry_ms: Option<u64>,
    pub value: DataValue,
}

// --- Writer ---

/// Serializes the live contents of `db` into a complete snapshot image.
pub fn save_to_bytes(db: &Db) -> Result<Bytes, JasperError> {
    let mut buf = BytesMut::new();
    buf.put_slice(SNAPSHOT_MAGIC);
    buf.put_slice(SNAPSHOT_VERSION);

    buf.put_u8(OPCODE_AUX);
    write_string(&mut buf, b"jasperdb-ver");
    write_string(&mut buf, env!("CARGO_PKG_VERSION").as_bytes());

    buf.put_u8(OPCODE_AUX);
    write_string(&mut buf, b"jasperdb-bits");
    write_string(&mut buf, b"64");

    let ctime = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    buf.put_u8(OPCODE_AUX);
    write_string(&mut buf, b"ctime");
    write_string(&mut buf, ctime.to_string().as_bytes());

    buf.put_u8(OPCODE_SELECTDB);
    write_length(&mut buf, 0);

    let kvs = db.all_kvs();
    let expiring = kvs.iter().filter(|(_, v)| v.expiry.is_some()).count();
    buf.put_u8(OPCODE_RESIZEDB);
    write_length(&mut buf, kvs.len() as u64);
    write_length(&mut buf, expiring as u64);

    for (key, value) in &kvs {
        write_kv(&mut buf, key, value);
    }

    buf.put_u8(OPCODE_EOF);
    let checksum = CHECKSUM_ALGO.checksum(&buf);
    buf.put_u64_le(checksum);
    Ok(buf.freeze())
}

/// Saves the current state of `db` to a snapshot file at the given path,
/// going through a temp file and an atomic rename.
pub async fn save(db: &Db, path: &str) -> Result<(), JasperError> {
    let bytes = save_to_bytes(db)?;
    let temp_path = format!("{}.tmp.{}", path, rand::random::<u32>());

    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(&bytes).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&temp_path, path).await?;
    info!("Snapshot saved to {} ({} bytes)", path, bytes.len());
    Ok(())
}

/// Writes a single key-value pair, including its expiry if it has one.
fn write_kv(buf: &mut BytesMut, key: &Bytes, value: &StoredValue) {
    if let Some(expiry) = value.expiry
        && let Some(remaining) = expiry.checked_duration_since(Instant::now())
        && let Ok(now_ms) = SystemTime::now().duration_since(UNIX_EPOCH)
    {
        let expiry_ms = now_ms.as_millis() as u64 + remaining.as_millis() as u64;
        buf.put_u8(OPCODE_EXPIRETIME_MS);
        buf.put_u64_le(expiry_ms);
    }

    match &value.data {
        DataValue::String(val) => {
            buf.put_u8(TYPE_STRING);
            write_string(buf, key);
            write_string(buf, val);
        }
        DataValue::List(list) => {
            buf.put_u8(TYPE_LIST);
            write_string(buf, key);
            write_length(buf, list.len() as u64);
            for item in list {
                write_string(buf, item);
            }
        }
        DataValue::Set(set) => {
            buf.put_u8(TYPE_SET);
            write_string(buf, key);
            write_length(buf, set.len() as u64);
            for member in set {
                write_string(buf, member);
            }
        }
        DataValue::Hash(hash) => {
            buf.put_u8(TYPE_HASH);
            write_string(buf, key);
            write_length(buf, hash.len() as u64);
            for (field, val) in hash {
                write_string(buf, field);
                write_string(buf, val);
            }
        }
    }
}

// --- Reader ---

/// A validated snapshot, iterated lazily record by record.
///
/// The constructor checks the magic, version, and CRC trailer up front and
/// fails with `SnapshotCorrupt` on any mismatch; iteration then yields
/// `SnapshotRecord`s in file order.
pub struct SnapshotReader {
    cursor: Bytes,
    finished: bool,
}

impl SnapshotReader {
    pub fn from_bytes(data: Bytes) -> Result<Self, JasperError> {
        if data.len() < SNAPSHOT_MAGIC.len() + SNAPSHOT_VERSION.len() + 8 {
            return Err(JasperError::SnapshotCorrupt(
                "file too short for header and checksum".into(),
            ));
        }

        let (body, checksum_part) = data.split_at(data.len() - 8);
        let expected = CHECKSUM_ALGO.checksum(body);
        let actual = (&checksum_part[..]).get_u64_le();
        if expected != actual {
            return Err(JasperError::SnapshotCorrupt(format!(
                "checksum mismatch (expected {expected:016x}, found {actual:016x})"
            )));
        }

        let mut cursor = data.slice(0..data.len() - 8);
        let magic = cursor.split_to(SNAPSHOT_MAGIC.len());
        if magic != SNAPSHOT_MAGIC {
            return Err(JasperError::SnapshotCorrupt("bad magic string".into()));
        }
        let version = cursor.split_to(SNAPSHOT_VERSION.len());
        if version != SNAPSHOT_VERSION {
            return Err(JasperError::SnapshotCorrupt(format!(
                "unsupported version {}",
                String::from_utf8_lossy(&version)
            )));
        }

        Ok(Self {
            cursor,
            finished: false,
        })
    }

    /// Consumes opcodes until the next key record or EOF.
    fn read_record(&mut self) -> Result<Option<SnapshotRecord>, JasperError> {
        let mut pending_expiry: Option<u64> = None;
        loop {
            if !self.cursor.has_remaining() {
                return Err(JasperError::SnapshotCorrupt(
                    "data ended without EOF opcode".into(),
                ));
            }
            let opcode = self.cursor.get_u8();
            match opcode {
                OPCODE_EOF => {
                    debug!("Snapshot EOF reached");
                    self.finished = true;
                    return Ok(None);
                }
                OPCODE_AUX => {
                    read_string(&mut self.cursor)?;
                    read_string(&mut self.cursor)?;
                }
                OPCODE_SELECTDB => {
                    let db_index = read_length(&mut self.cursor)?;
                    if db_index != 0 {
                        return Err(JasperError::SnapshotCorrupt(format!(
                            "unexpected database index {db_index}"
                        )));
                    }
                }
                OPCODE_RESIZEDB => {
                    read_length(&mut self.cursor)?;
                    read_length(&mut self.cursor)?;
                }
                OPCODE_EXPIRETIME_MS => {
                    if self.cursor.remaining() < 8 {
                        return Err(JasperError::SnapshotCorrupt(
                            "truncated expiry timestamp".into(),
                        ));
                    }
                    pending_expiry = Some(self.cursor.get_u64_le());
                }
                value_type => {
                    let key = read_string(&mut self.cursor)?;
                    let value = read_value(&mut self.cursor, value_type)?;
                    return Ok(Some(SnapshotRecord {
                        key,
                        expiry_ms: pending_expiry.take(),
                        value,
                    }));
                }
            }
        }
    }
}

impl Iterator for SnapshotReader {
    type Item = Result<SnapshotRecord, JasperError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Loads a snapshot file into `db`, skipping records that expired before the
/// load. Returns the number of keys loaded. A missing file is not an error.
pub async fn load(path: &str, db: &Db) -> Result<usize, JasperError> {
    let data = match fs::read(path).await {
        Ok(data) => Bytes::from(data),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("Snapshot file not found at {}. Starting empty.", path);
            return Ok(0);
        }
        Err(e) => return Err(e.into()),
    };

    let reader = SnapshotReader::from_bytes(data)?;
    db.clear();

    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let mut loaded = 0usize;
    for record in reader {
        let record = record?;
        let mut stored = StoredValue::new(record.value);
        if let Some(expiry_ms) = record.expiry_ms {
            if expiry_ms <= now_ms {
                continue;
            }
            stored.expiry = Some(Instant::now() + Duration::from_millis(expiry_ms - now_ms));
        }
        db.insert_from_load(record.key, stored);
        loaded += 1;
    }
    info!("Loaded {} keys from snapshot {}", loaded, path);
    Ok(loaded)
}

fn read_value(cursor: &mut Bytes, value_type: u8) -> Result<DataValue, JasperError> {
    match value_type {
        TYPE_STRING => Ok(DataValue::String(read_string(cursor)?)),
        TYPE_LIST => {
            let len = read_length(cursor)? as usize;
            let mut list = VecDeque::with_capacity(len.min(1024));
            for _ in 0..len {
                list.push_back(read_string(cursor)?);
            }
            Ok(DataValue::List(list))
        }
        TYPE_SET => {
            let len = read_length(cursor)? as usize;
            let mut set = HashSet::with_capacity(len.min(1024));
            for _ in 0..len {
                set.insert(read_string(cursor)?);
            }
            Ok(DataValue::Set(set))
        }
        TYPE_HASH => {
            let len = read_length(cursor)? as usize;
            let mut hash = IndexMap::with_capacity(len.min(1024));
            for _ in 0..len {
                let field = read_string(cursor)?;
                let val = read_string(cursor)?;
                hash.insert(field, val);
            }
            Ok(DataValue::Hash(hash))
        }
        TYPE_ZSET => Err(JasperError::SnapshotCorrupt(
            "sorted-set records are not supported".into(),
        )),
        other => Err(JasperError::SnapshotCorrupt(format!(
            "unknown value type {other}"
        ))),
    }
}

// --- Length and string encoding helpers ---

/// Length encoding: 6-bit (`0b00xxxxxx`), 14-bit (`0b01xxxxxx xxxxxxxx`),
/// or 32-bit (`0x80` followed by a big-endian u32).
pub fn write_length(buf: &mut BytesMut, len: u64) {
    if len < (1 << 6) {
        buf.put_u8(len as u8);
    } else if len < (1 << 14) {
        buf.put_u16((len | (1 << 14)) as u16);
    } else {
        debug_assert!(len < (1 << 32));
        buf.put_u8(0x80);
        buf.put_u32(len as u32);
    }
}

pub fn read_length(cursor: &mut Bytes) -> Result<u64, JasperError> {
    if !cursor.has_remaining() {
        return Err(JasperError::SnapshotCorrupt("cannot read length".into()));
    }
    let first = cursor.get_u8();
    match (first & 0xC0) >> 6 {
        0b00 => Ok(u64::from(first & 0x3F)),
        0b01 => {
            if !cursor.has_remaining() {
                return Err(JasperError::SnapshotCorrupt(
                    "truncated 14-bit length".into(),
                ));
            }
            let next = cursor.get_u8();
            Ok(u64::from(((first as u16 & 0x3F) << 8) | next as u16))
        }
        0b10 if first == 0x80 => {
            if cursor.remaining() < 4 {
                return Err(JasperError::SnapshotCorrupt(
                    "truncated 32-bit length".into(),
                ));
            }
            Ok(u64::from(cursor.get_u32()))
        }
        _ => Err(JasperError::SnapshotCorrupt(format!(
            "unknown length encoding byte {first:#04x}"
        ))),
    }
}

fn write_string(buf: &mut BytesMut, s: &[u8]) {
    write_length(buf, s.len() as u64);
    buf.put_slice(s);
}

fn read_string(cursor: &mut Bytes) -> Result<Bytes, JasperError> {
    let len = read_length(cursor)? as usize;
    if cursor.remaining() < len {
        return Err(JasperError::SnapshotCorrupt(
            "not enough data for string".into(),
        ));
    }
    Ok(cursor.split_to(len))
}
