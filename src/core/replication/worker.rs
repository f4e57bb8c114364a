// src/core/replication/worker.rs

//! Implements the replication logic for a replica server.
//!
//! The worker owns the replica's connection to its primary: it performs the
//! multi-step handshake, handles both full (snapshot transfer) and partial
//! (backlog) resynchronization, then applies the continuous stream of write
//! commands through the bypass path that skips the read-only guard. It
//! reconnects with exponential backoff and reacts to `REPLICAOF` role
//! changes in both directions.

use crate::core::JasperError;
use crate::core::commands::dispatch;
use crate::core::persistence::snapshot::SnapshotReader;
use crate::core::protocol::{RespFrame, RespFrameCodec, resp_frame::parse_frame};
use crate::core::state::ServerState;
use crate::core::storage::data_types::StoredValue;
use bytes::{Buf, Bytes, BytesMut};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf, split};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::codec::Decoder;
use tracing::{info, warn};

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(5);
const ACK_INTERVAL: Duration = Duration::from_secs(1);

/// The result of a successful handshake with the primary.
#[derive(PartialEq, Debug)]
enum HandshakeResult {
    /// The primary requires a full resynchronization (snapshot transfer).
    FullResync { replid: String, offset: u64 },
    /// The primary will send only the missed commands from its backlog.
    PartialResync,
}

pub struct ReplicaWorker {
    state: Arc<ServerState>,
}

impl ReplicaWorker {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    /// Runs until this server stops being a replica.
    pub async fn run(self) {
        let mut role_change_rx = self.state.role_change_tx.subscribe();
        let mut reconnect_delay = INITIAL_RECONNECT_DELAY;

        loop {
            let Some((host, port)) = self.current_target() else {
                return;
            };

            info!("Replica worker connecting to primary {}:{}", host, port);
            let result = self.replicate_from(&host, port, &mut role_change_rx).await;
            self.set_link_up(false);
            match result {
                Ok(RoleChanged) => {
                    if self.current_target().is_none() {
                        info!("Promoted to primary; replica worker exiting.");
                        return;
                    }
                    // Target changed: reconnect immediately to the new primary.
                    reconnect_delay = INITIAL_RECONNECT_DELAY;
                }
                Err(e) => {
                    warn!(
                        "Replication link to {}:{} failed: {}. Retrying in {:?}.",
                        host, port, e, reconnect_delay
                    );
                    // A role change cuts the backoff short so promotion or a
                    // new target takes effect immediately.
                    tokio::select! {
                        _ = tokio::time::sleep(reconnect_delay) => {}
                        _ = role_change_rx.recv() => {}
                    }
                    reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY);
                }
            }
        }
    }

    fn current_target(&self) -> Option<(String, u16)> {
        self.state
            .replication
            .replica_info
            .lock()
            .as_ref()
            .map(|info| (info.master_host.clone(), info.master_port))
    }

    fn set_link_up(&self, up: bool) {
        if let Some(info) = self.state.replication.replica_info.lock().as_mut() {
            info.link_up = up;
        }
    }

    fn set_processed_offset(&self, offset: u64) {
        if let Some(info) = self.state.replication.replica_info.lock().as_mut() {
            info.processed_offset = offset;
        }
    }

    fn processed_offset(&self) -> u64 {
        self.state
            .replication
            .replica_info
            .lock()
            .as_ref()
            .map(|info| info.processed_offset)
            .unwrap_or(0)
    }

    /// One full connect-handshake-stream cycle. Returns `Ok(RoleChanged)`
    /// when a role or target change ended the cycle, `Err` on link failure.
    async fn replicate_from(
        &self,
        host: &str,
        port: u16,
        role_change_rx: &mut broadcast::Receiver<()>,
    ) -> Result<RoleChanged, JasperError> {
        let addr = format!("{host}:{port}");
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| JasperError::ReplicationError(format!("connect to {addr} timed out")))??;

        let (mut read_half, mut write_half) = split(stream);
        let mut buf = BytesMut::with_capacity(16 * 1024);

        let handshake = self
            .perform_handshake(&mut read_half, &mut write_half, &mut buf)
            .await?;

        match handshake {
            HandshakeResult::FullResync { replid, offset } => {
                info!(
                    "Primary {} requires full resync from offset {} (replid {}).",
                    addr, offset, replid
                );
                self.receive_and_load_snapshot(&mut read_half, &mut buf).await?;
                if let Some(info) = self.state.replication.replica_info.lock().as_mut() {
                    info.master_replid = replid;
                    info.processed_offset = offset;
                }
            }
            HandshakeResult::PartialResync => {
                info!("Primary {} accepted partial resync.", addr);
            }
        }

        self.set_link_up(true);
        self.stream_commands(read_half, write_half, buf, role_change_rx)
            .await
    }

    /// `PING` -> `REPLCONF listening-port` -> `REPLCONF capa` ->
    /// `REPLCONF priority` -> `PSYNC`.
    async fn perform_handshake(
        &self,
        read_half: &mut ReadHalf<TcpStream>,
        write_half: &mut WriteHalf<TcpStream>,
        buf: &mut BytesMut,
    ) -> Result<HandshakeResult, JasperError> {
        self.send_command(write_half, &["PING"]).await?;
        expect_simple(read_next_frame(read_half, buf).await?, "PONG")?;

        let my_port = self.state.config.port.to_string();
        self.send_command(write_half, &["REPLCONF", "listening-port", &my_port])
            .await?;
        expect_simple(read_next_frame(read_half, buf).await?, "OK")?;

        self.send_command(write_half, &["REPLCONF", "capa", "psync2"])
            .await?;
        expect_simple(read_next_frame(read_half, buf).await?, "OK")?;

        let priority = self.state.config.replica_priority.to_string();
        self.send_command(write_half, &["REPLCONF", "priority", &priority])
            .await?;
        expect_simple(read_next_frame(read_half, buf).await?, "OK")?;

        // Resume from our position when we know the primary's replication id;
        // "?" forces a full resync.
        let (known_replid, offset) = {
            let replica_info = self.state.replication.replica_info.lock();
            match replica_info.as_ref() {
                Some(info) => (info.master_replid.clone(), info.processed_offset),
                None => (String::new(), 0),
            }
        };
        let (psync_id, psync_offset) = if !known_replid.is_empty() {
            (known_replid, offset.to_string())
        } else {
            ("?".to_string(), "-1".to_string())
        };
        self.send_command(write_half, &["PSYNC", &psync_id, &psync_offset])
            .await?;

        let response = read_next_frame(read_half, buf).await?;
        let RespFrame::SimpleString(line) = response else {
            return Err(JasperError::ReplicationError(format!(
                "expected simple string for PSYNC, got {response:?}"
            )));
        };

        if line == "CONTINUE" {
            return Ok(HandshakeResult::PartialResync);
        }
        if let Some(rest) = line.strip_prefix("FULLRESYNC ") {
            let mut parts = rest.split_whitespace();
            let replid = parts
                .next()
                .ok_or_else(|| JasperError::ReplicationError("FULLRESYNC missing replid".into()))?
                .to_string();
            let offset = parts
                .next()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| JasperError::ReplicationError("FULLRESYNC missing offset".into()))?;
            return Ok(HandshakeResult::FullResync { replid, offset });
        }
        Err(JasperError::ReplicationError(format!(
            "unexpected PSYNC response: {line}"
        )))
    }

    /// Reads the `$<len>\r\n<bytes>` snapshot transfer and loads it.
    async fn receive_and_load_snapshot(
        &self,
        read_half: &mut ReadHalf<TcpStream>,
        buf: &mut BytesMut,
    ) -> Result<(), JasperError> {
        // Read the length header line.
        let len = loop {
            if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
                if buf.first() != Some(&b'$') {
                    return Err(JasperError::ReplicationError(
                        "snapshot transfer missing '$' header".into(),
                    ));
                }
                let len: usize = String::from_utf8_lossy(&buf[1..pos])
                    .parse()
                    .map_err(|_| {
                        JasperError::ReplicationError("bad snapshot length header".into())
                    })?;
                buf.advance(pos + 2);
                break len;
            }
            read_more(read_half, buf).await?;
        };

        while buf.len() < len {
            read_more(read_half, buf).await?;
        }
        let snapshot_bytes = buf.split_to(len).freeze();
        info!("Received snapshot of {} bytes from primary.", len);

        let reader = SnapshotReader::from_bytes(snapshot_bytes)?;
        self.state.db.clear();
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        for record in reader {
            let record = record?;
            let mut stored = StoredValue::new(record.value);
            if let Some(expiry_ms) = record.expiry_ms {
                if expiry_ms <= now_ms {
                    continue;
                }
                stored.expiry =
                    Some(Instant::now() + Duration::from_millis(expiry_ms - now_ms));
            }
            self.state.db.insert_from_load(record.key, stored);
        }
        info!("Snapshot loaded; replica dataset replaced.");
        Ok(())
    }

    /// Applies the live command stream, acking the processed offset at 1 Hz.
    async fn stream_commands(
        &self,
        mut read_half: ReadHalf<TcpStream>,
        mut write_half: WriteHalf<TcpStream>,
        mut buf: BytesMut,
        role_change_rx: &mut broadcast::Receiver<()>,
    ) -> Result<RoleChanged, JasperError> {
        let mut codec = RespFrameCodec;
        let mut ack_tick = tokio::time::interval(ACK_INTERVAL);
        let target = self.current_target();

        loop {
            // Drain every complete frame already buffered before waiting on I/O.
            while let Some(frame) = codec.decode(&mut buf)? {
                self.apply_stream_frame(frame).await;
            }

            tokio::select! {
                _ = role_change_rx.recv() => {
                    if self.current_target() != target {
                        return Ok(RoleChanged);
                    }
                }
                _ = ack_tick.tick() => {
                    let offset = self.processed_offset().to_string();
                    self.send_command(&mut write_half, &["REPLCONF", "ACK", &offset])
                        .await?;
                }
                result = read_more(&mut read_half, &mut buf) => {
                    result?;
                }
            }
        }
    }

    /// Applies one streamed frame through the read-only bypass and advances
    /// the processed offset by the frame's encoded length.
    async fn apply_stream_frame(&self, frame: RespFrame) {
        let frame_len = match frame.encode_to_vec() {
            Ok(encoded) => encoded.len() as u64,
            Err(e) => {
                warn!("Unencodable frame on replication stream: {}", e);
                return;
            }
        };
        let args: Vec<Bytes> = match frame.into_args() {
            Ok(args) => args,
            Err(e) => {
                warn!("Non-command frame on replication stream: {}", e);
                return;
            }
        };
        if let Err(e) = dispatch::execute_replicated(&self.state, args).await {
            warn!("Replicated command failed: {}", e);
        }
        let new_offset = self.processed_offset() + frame_len;
        self.set_processed_offset(new_offset);
    }

    async fn send_command(
        &self,
        write_half: &mut WriteHalf<TcpStream>,
        args: &[&str],
    ) -> Result<(), JasperError> {
        let frame = RespFrame::command(args.iter().map(|s| Bytes::from(s.to_string())));
        let encoded = frame.encode_to_vec()?;
        write_half.write_all(&encoded).await?;
        Ok(())
    }
}

/// Marker for a cycle that ended because the role or target changed.
pub struct RoleChanged;

async fn read_more(
    read_half: &mut ReadHalf<TcpStream>,
    buf: &mut BytesMut,
) -> Result<(), JasperError> {
    let n = read_half.read_buf(buf).await?;
    if n == 0 {
        return Err(JasperError::ReplicationError(
            "connection closed by primary".into(),
        ));
    }
    Ok(())
}

/// Reads one complete RESP frame, waiting for more data as needed. Used only
/// during the handshake, where each reply is a single frame.
async fn read_next_frame(
    read_half: &mut ReadHalf<TcpStream>,
    buf: &mut BytesMut,
) -> Result<RespFrame, JasperError> {
    loop {
        match parse_frame(buf) {
            Ok((frame, len)) => {
                buf.advance(len);
                return frame_ok(frame);
            }
            Err(JasperError::IncompleteData) => {
                tokio::time::timeout(HANDSHAKE_READ_TIMEOUT, read_more(read_half, buf))
                    .await
                    .map_err(|_| {
                        JasperError::ReplicationError("handshake read timed out".into())
                    })??;
            }
            Err(e) => return Err(e),
        }
    }
}

fn frame_ok(frame: RespFrame) -> Result<RespFrame, JasperError> {
    if let RespFrame::Error(e) = frame {
        return Err(JasperError::ReplicationError(format!(
            "primary replied with error: {e}"
        )));
    }
    Ok(frame)
}

fn expect_simple(frame: RespFrame, expected: &str) -> Result<(), JasperError> {
    match frame {
        RespFrame::SimpleString(s) if s.eq_ignore_ascii_case(expected) => Ok(()),
        other => Err(JasperError::ReplicationError(format!(
            "expected +{expected}, got {other:?}"
        ))),
    }
}
