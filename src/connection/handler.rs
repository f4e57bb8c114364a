// src/connection/handler.rs

//! Handles one client connection: FIFO pipelining over a framed RESP stream,
//! the write pipeline (read-only guard, slot ownership, store, AOF,
//! replication fan-out), and the two session-changing handoffs: `PSYNC`
//! (replica stream) and `SUBSCRIBE` (pub/sub mode).

use crate::core::JasperError;
use crate::core::commands::{Command, dispatch};
use crate::core::protocol::{RespFrame, RespFrameCodec};
use crate::core::replication::handler::ReplicaHandler;
use crate::core::state::{ReplicaStateInfo, ReplicaSyncState, ServerState};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

/// Connections idle longer than this are closed.
const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// What the command processor asks the session loop to do next.
enum Action {
    Reply(RespFrame),
    /// Hand the stream off to a replica handler.
    Psync { replid: String, offset: String },
    /// Switch the session into pub/sub mode.
    Subscribe { channels: Vec<Bytes> },
}

pub struct ConnectionHandler {
    state: Arc<ServerState>,
    addr: SocketAddr,
    framed: Framed<TcpStream, RespFrameCodec>,
    /// Replica attributes announced via REPLCONF before PSYNC.
    pending_listening_port: Option<u16>,
    pending_priority: Option<u32>,
    /// One-shot ASKING announcement, consumed by the next command.
    asking: bool,
}

impl ConnectionHandler {
    pub fn new(state: Arc<ServerState>, addr: SocketAddr, socket: TcpStream) -> Self {
        Self {
            state,
            addr,
            framed: Framed::new(socket, RespFrameCodec),
            pending_listening_port: None,
            pending_priority: None,
            asking: false,
        }
    }

    pub async fn run(mut self) {
        let mut shutdown_rx = self.state.shutdown_tx.subscribe();

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => return,
                next = tokio::time::timeout(CLIENT_IDLE_TIMEOUT, self.framed.next()) => next,
            };

            let frame = match next {
                Err(_) => {
                    debug!("Connection {} idle for {:?}; closing.", self.addr, CLIENT_IDLE_TIMEOUT);
                    return;
                }
                Ok(None) => return,
                Ok(Some(Err(e))) => {
                    // Protocol errors get a reply, not a hangup; drop the
                    // unparseable bytes so the stream can resynchronize.
                    self.framed.read_buffer_mut().clear();
                    if self.send(error_frame(&e)).await.is_err() {
                        return;
                    }
                    continue;
                }
                Ok(Some(Ok(frame))) => frame,
            };

            let action = match self.process_frame(frame).await {
                Ok(action) => action,
                Err(e) => Action::Reply(error_frame(&e)),
            };

            match action {
                Action::Reply(reply) => {
                    if self.send(reply).await.is_err() {
                        return;
                    }
                }
                Action::Psync { replid, offset } => {
                    self.register_replica();
                    let parts = self.framed.into_parts();
                    let handler = ReplicaHandler::new(self.state.clone(), self.addr, parts.io);
                    handler
                        .run(replid, offset, self.state.shutdown_tx.subscribe())
                        .await;
                    return;
                }
                Action::Subscribe { channels } => {
                    if self.run_pubsub_mode(channels).await.is_err() {
                        return;
                    }
                    self.state.pubsub.purge_empty_channels();
                    return;
                }
            }
        }
    }

    async fn send(&mut self, frame: RespFrame) -> Result<(), JasperError> {
        self.framed.send(frame).await
    }

    async fn process_frame(&mut self, frame: RespFrame) -> Result<Action, JasperError> {
        let args = frame.into_args()?;
        let cmd = Command::parse(&args)?;

        match cmd {
            Command::Psync { replid, offset } => Ok(Action::Psync { replid, offset }),
            Command::Subscribe { channels } => Ok(Action::Subscribe { channels }),
            Command::Asking => {
                self.asking = true;
                Ok(Action::Reply(RespFrame::SimpleString("OK".into())))
            }
            Command::ReplicaOf { target } => {
                match target {
                    Some((host, port)) => {
                        warn!(
                            "REPLICAOF {}:{} received; demoting to replica.",
                            host, port
                        );
                        self.state.set_role_replica(host, port);
                    }
                    None => {
                        warn!("REPLICAOF NO ONE received; promoting to primary.");
                        self.state.set_role_master();
                    }
                }
                Ok(Action::Reply(RespFrame::SimpleString("OK".into())))
            }
            Command::ReplConf { ref pairs } => {
                for (key, value) in pairs {
                    match key.as_str() {
                        "listening-port" => {
                            self.pending_listening_port = value.parse().ok();
                        }
                        "priority" => {
                            self.pending_priority = value.parse().ok();
                        }
                        // capa and ack need no connection-level state here.
                        _ => {}
                    }
                }
                Ok(Action::Reply(RespFrame::SimpleString("OK".into())))
            }
            cmd => self.execute_pipeline(cmd, args).await.map(Action::Reply),
        }
    }

    /// The write pipeline: guard, ownership, store, AOF, fan-out, reply.
    async fn execute_pipeline(
        &mut self,
        cmd: Command,
        args: Vec<Bytes>,
    ) -> Result<RespFrame, JasperError> {
        // The ASKING announcement covers exactly one follow-up command.
        let asking = std::mem::take(&mut self.asking);

        if cmd.is_write() {
            // The read-only guard comes first: a replica answers READONLY
            // even for slots it would otherwise redirect.
            if self.state.is_read_only.load(Ordering::SeqCst) {
                return Err(JasperError::ReadOnly(
                    "You can't write against a read only replica.".into(),
                ));
            }
            self.check_slot_ownership(&cmd, asking)?;

            let reply = dispatch::execute_data(&self.state, &cmd)?;

            // Durability and fan-out both happen before the client sees +OK.
            if let Some(aof) = &self.state.aof {
                aof.append(RespFrame::command(args.clone())).await?;
            }
            self.state.event_bus.publish(RespFrame::command(args));

            Ok(reply)
        } else {
            self.check_slot_ownership(&cmd, asking)?;
            dispatch::execute_data(&self.state, &cmd)
        }
    }

    /// Routes keyed commands through the slot-ownership table, feeding it
    /// the local key presence that the ASK decision depends on.
    fn check_slot_ownership(&self, cmd: &Command, asking: bool) -> Result<(), JasperError> {
        let Some(cluster) = &self.state.cluster else {
            return Ok(());
        };
        let keys = cmd.keys();
        if keys.is_empty() {
            return Ok(());
        }
        let all_present = keys.iter().all(|k| self.state.db.exists(k));
        cluster.check_multi_key_ownership(&keys, asking, all_present)
    }

    /// Inserts the replica-state entry for a connection that is about to
    /// become a replication stream.
    fn register_replica(&self) {
        self.state.replica_states.insert(
            self.addr,
            ReplicaStateInfo {
                sync_state: ReplicaSyncState::AwaitingFullSync,
                listening_port: self.pending_listening_port.unwrap_or_else(|| self.addr.port()),
                priority: self.pending_priority.unwrap_or(100),
                ack_offset: 0,
                last_ack_time: Instant::now(),
            },
        );
    }

    /// Pub/sub mode: confirm each subscription, then forward published
    /// messages until the client goes away.
    async fn run_pubsub_mode(&mut self, channels: Vec<Bytes>) -> Result<(), JasperError> {
        let (tx, mut rx) = mpsc::channel::<(Bytes, Bytes)>(128);

        for (i, channel) in channels.iter().enumerate() {
            let mut receiver = self.state.pubsub.subscribe(channel);
            let forward_tx = tx.clone();
            let channel_name = channel.clone();
            let mut shutdown_rx = self.state.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => return,
                        message = receiver.recv() => {
                            let Ok(message) = message else { return };
                            if forward_tx.send((channel_name.clone(), message)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });

            self.send(RespFrame::Array(vec![
                RespFrame::BulkString(Bytes::from_static(b"subscribe")),
                RespFrame::BulkString(channel.clone()),
                RespFrame::Integer((i + 1) as i64),
            ]))
            .await?;
        }
        drop(tx);

        let mut shutdown_rx = self.state.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return Ok(()),
                message = rx.recv() => {
                    let Some((channel, payload)) = message else {
                        return Ok(());
                    };
                    self.send(RespFrame::Array(vec![
                        RespFrame::BulkString(Bytes::from_static(b"message")),
                        RespFrame::BulkString(channel),
                        RespFrame::BulkString(payload),
                    ]))
                    .await?;
                }
                next = self.framed.next() => {
                    match next {
                        None => return Ok(()),
                        Some(Err(_)) => return Ok(()),
                        Some(Ok(_)) => {
                            // Only a limited surface makes sense mid-subscription.
                            self.send(RespFrame::Error(
                                "ERR only (P)SUBSCRIBE / (P)UNSUBSCRIBE / PING / QUIT allowed in this context".into(),
                            ))
                            .await?;
                        }
                    }
                }
            }
        }
    }
}

/// Maps an error onto the RESP wire. Errors that carry their own protocol
/// prefix (MOVED, READONLY, WRONGTYPE, ...) go out verbatim; the rest get
/// the generic `ERR` prefix.
pub fn error_frame(e: &JasperError) -> RespFrame {
    let text = match e {
        JasperError::Moved { .. }
        | JasperError::Ask { .. }
        | JasperError::CrossSlot
        | JasperError::ClusterDown(_)
        | JasperError::ReadOnly(_)
        | JasperError::WrongType => e.to_string(),
        other => format!("ERR {other}"),
    };
    RespFrame::Error(text)
}
