// src/core/sentinel/client.rs

//! A small, internal, asynchronous RESP client used by the sentinel to talk
//! to monitored data servers and to peer sentinels.

use crate::core::protocol::{RespFrame, RespFrameCodec};
use anyhow::{Result, anyhow};
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder};

/// Probe/RPC connect deadline.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Per-request write deadline.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(2);
/// Default per-reply read deadline.
pub const READ_TIMEOUT: Duration = Duration::from_secs(2);
/// Deadline for `REPLICAOF` reconfiguration commands.
pub const RECONFIGURE_TIMEOUT: Duration = Duration::from_secs(5);

/// The decoded reply to `SENTINEL IS-MASTER-DOWN-BY-ADDR`.
#[derive(Debug, Clone, PartialEq)]
pub struct VoteReply {
    pub agrees: bool,
    pub leader: Option<String>,
    pub epoch: u64,
}

/// An internal client for sending commands to and receiving responses from
/// data servers and peer sentinels.
#[derive(Debug)]
pub struct SentinelClient {
    stream: TcpStream,
    codec: RespFrameCodec,
}

impl SentinelClient {
    /// Attempts to connect to `host:port` within the probe deadline.
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow!("connect to {addr} timed out"))??;
        Ok(Self {
            stream,
            codec: RespFrameCodec,
        })
    }

    /// Sends a RESP frame and waits for a single reply frame within `read_timeout`.
    pub async fn send_and_receive(
        &mut self,
        frame: RespFrame,
        read_timeout: Duration,
    ) -> Result<RespFrame> {
        let mut write_buf = BytesMut::new();
        self.codec.encode(frame, &mut write_buf)?;
        tokio::time::timeout(WRITE_TIMEOUT, self.stream.write_all(&write_buf))
            .await
            .map_err(|_| anyhow!("write timeout while sending request"))??;

        let mut read_buf = BytesMut::with_capacity(4096);
        loop {
            if let Some(reply) = self.codec.decode(&mut read_buf)? {
                return Ok(reply);
            }
            let read_fut = self.stream.read_buf(&mut read_buf);
            match tokio::time::timeout(read_timeout, read_fut).await {
                Ok(Ok(0)) => return Err(anyhow!("connection closed by peer")),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(anyhow!("read timeout while waiting for response")),
            }
        }
    }

    fn command(args: &[&str]) -> RespFrame {
        RespFrame::command(args.iter().map(|s| Bytes::from(s.to_string())))
    }

    /// Sends `PING` and expects a simple-string reply starting with `+` on
    /// the wire (i.e. any RESP simple string).
    pub async fn ping(&mut self) -> Result<String> {
        let reply = self
            .send_and_receive(Self::command(&["PING"]), READ_TIMEOUT)
            .await?;
        match reply {
            RespFrame::SimpleString(s) => Ok(s),
            other => Err(anyhow!("unexpected PING reply: {other:?}")),
        }
    }

    /// Sends `INFO replication` and returns the raw section text.
    pub async fn info_replication(&mut self) -> Result<String> {
        let reply = self
            .send_and_receive(Self::command(&["INFO", "replication"]), READ_TIMEOUT)
            .await?;
        match reply {
            RespFrame::BulkString(bs) => Ok(String::from_utf8_lossy(&bs).to_string()),
            other => Err(anyhow!("unexpected INFO reply: {other:?}")),
        }
    }

    /// Sends `REPLICAOF NO ONE`, expecting `+OK` within the reconfigure deadline.
    pub async fn replicaof_no_one(&mut self) -> Result<()> {
        let reply = self
            .send_and_receive(
                Self::command(&["REPLICAOF", "NO", "ONE"]),
                RECONFIGURE_TIMEOUT,
            )
            .await?;
        expect_ok(reply)
    }

    /// Sends `REPLICAOF host port`, expecting `+OK` within the reconfigure deadline.
    pub async fn replicaof(&mut self, host: &str, port: u16) -> Result<()> {
        let port = port.to_string();
        let reply = self
            .send_and_receive(
                Self::command(&["REPLICAOF", host, &port]),
                RECONFIGURE_TIMEOUT,
            )
            .await?;
        expect_ok(reply)
    }

    /// Publishes a message on a channel, best-effort.
    pub async fn publish(&mut self, channel: &str, message: &str) -> Result<()> {
        self.send_and_receive(Self::command(&["PUBLISH", channel, message]), READ_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Asks a peer sentinel for its view of the master and, implicitly, its
    /// vote for `candidate_id` in `epoch`.
    pub async fn is_master_down_by_addr(
        &mut self,
        master_host: &str,
        master_port: u16,
        epoch: u64,
        candidate_id: &str,
    ) -> Result<VoteReply> {
        let port = master_port.to_string();
        let epoch_str = epoch.to_string();
        let frame = Self::command(&[
            "SENTINEL",
            "IS-MASTER-DOWN-BY-ADDR",
            master_host,
            &port,
            &epoch_str,
            candidate_id,
        ]);
        let reply = self.send_and_receive(frame, READ_TIMEOUT).await?;

        let RespFrame::Array(items) = reply else {
            return Err(anyhow!("vote reply is not an array"));
        };
        if items.len() != 3 {
            return Err(anyhow!("vote reply has {} elements, expected 3", items.len()));
        }
        let agrees = matches!(items[0], RespFrame::Integer(1));
        let leader = match &items[1] {
            RespFrame::BulkString(b) => Some(String::from_utf8_lossy(b).to_string()),
            RespFrame::Null => None,
            other => return Err(anyhow!("unexpected leader field: {other:?}")),
        };
        let epoch = match items[2] {
            RespFrame::Integer(e) => e as u64,
            ref other => return Err(anyhow!("unexpected epoch field: {other:?}")),
        };
        Ok(VoteReply {
            agrees,
            leader,
            epoch,
        })
    }

    /// Asks a peer sentinel for the current master address of `name`.
    pub async fn get_master_addr_by_name(&mut self, name: &str) -> Result<Option<(String, u16)>> {
        let reply = self
            .send_and_receive(
                Self::command(&["SENTINEL", "GET-MASTER-ADDR-BY-NAME", name]),
                READ_TIMEOUT,
            )
            .await?;
        parse_addr_reply(reply)
    }
}

fn expect_ok(reply: RespFrame) -> Result<()> {
    match reply {
        RespFrame::SimpleString(s) if s.eq_ignore_ascii_case("ok") => Ok(()),
        other => Err(anyhow!("expected +OK, got {other:?}")),
    }
}

/// Parses a `[host, port]` address reply; `Null`/`NullArray` mean unknown.
pub fn parse_addr_reply(reply: RespFrame) -> Result<Option<(String, u16)>> {
    match reply {
        RespFrame::Null | RespFrame::NullArray => Ok(None),
        RespFrame::Array(items) if items.len() == 2 => {
            let host = match &items[0] {
                RespFrame::BulkString(b) => String::from_utf8_lossy(b).to_string(),
                RespFrame::SimpleString(s) => s.clone(),
                other => return Err(anyhow!("unexpected host field: {other:?}")),
            };
            let port = match &items[1] {
                RespFrame::Integer(p) => *p as u16,
                RespFrame::BulkString(b) => String::from_utf8_lossy(b).parse()?,
                other => return Err(anyhow!("unexpected port field: {other:?}")),
            };
            Ok(Some((host, port)))
        }
        other => Err(anyhow!("unexpected address reply: {other:?}")),
    }
}
