// src/core/replication/handler.rs

//! Handles an incoming connection from a replica that has sent `PSYNC`.
//!
//! The connection handler hands the TCP stream off to a `ReplicaHandler`,
//! whose sole responsibility is the synchronization of that single replica:
//! deciding between a partial resynchronization (backlog suffix) and a full
//! one (snapshot stream), then streaming live command updates in offset
//! order while reading `REPLCONF ACK` frames off the same socket.

use crate::core::persistence::snapshot;
use crate::core::protocol::{RespFrame, RespFrameCodec};
use crate::core::state::{ReplicaStateInfo, ReplicaSyncState, ServerState};
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf, split};
use tokio::sync::broadcast;
use tokio_util::codec::FramedRead;
use tracing::{info, warn};

pub struct ReplicaHandler<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> {
    state: Arc<ServerState>,
    addr: SocketAddr,
    stream: S,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> ReplicaHandler<S> {
    pub fn new(state: Arc<ServerState>, addr: SocketAddr, stream: S) -> Self {
        Self {
            state,
            addr,
            stream,
        }
    }

    /// Runs the whole lifecycle of the replica's session and cleans up its
    /// state entry when the link drops for any reason.
    pub async fn run(
        mut self,
        repl_id: String,
        offset_str: String,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let result = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                info!("Replica handler for {} received shutdown signal.", self.addr);
                Ok(())
            }
            res = self.perform_sync_cycle(repl_id, offset_str) => res,
        };

        if let Err(e) = result {
            warn!("Replication sync cycle for {} ended: {}", self.addr, e);
        }

        info!(
            "Replica handler for {} is terminating. Cleaning up its state.",
            self.addr
        );
        self.state.replica_states.remove(&self.addr);
    }

    async fn perform_sync_cycle(
        &mut self,
        repl_id: String,
        offset_str: String,
    ) -> anyhow::Result<()> {
        info!(
            "Replica at {} requested sync with id '{}' and offset '{}'",
            self.addr, repl_id, offset_str
        );

        let master_replid = self
            .state
            .replication
            .replication_info
            .master_replid
            .clone();

        // A partial resync is possible when the replica's known id matches
        // this primary and its offset is still covered by the backlog.
        let resumable = if repl_id.eq_ignore_ascii_case(&master_replid) {
            match offset_str.parse::<u64>() {
                Ok(offset) => self
                    .state
                    .replication_backlog
                    .collect_from(offset)
                    .map(|missed| (offset, missed)),
                Err(_) => None,
            }
        } else {
            None
        };

        if let Some((offset, missed)) = resumable {
            self.mark_online();
            self.stream.write_all(b"+CONTINUE\r\n").await?;
            info!("Performing partial resync for replica {}", self.addr);
            let mut resume_from = offset;
            for entry in missed {
                let encoded = entry.frame.encode_to_vec()?;
                self.stream.write_all(&encoded).await?;
                resume_from = entry.end_offset();
            }
            self.stream_live_updates(resume_from).await;
            return Ok(());
        }

        // Full resync path.
        if let Some(mut entry) = self.state.replica_states.get_mut(&self.addr) {
            entry.value_mut().sync_state = ReplicaSyncState::AwaitingFullSync;
        }

        info!("Performing full resync for replica {}", self.addr);
        let sync_start_offset = self.state.replication.get_replication_offset();
        let header = format!("+FULLRESYNC {master_replid} {sync_start_offset}\r\n");
        self.stream.write_all(header.as_bytes()).await?;

        let snapshot_bytes = snapshot::save_to_bytes(&self.state.db)?;
        let len_header = format!("${}\r\n", snapshot_bytes.len());
        self.stream.write_all(len_header.as_bytes()).await?;
        self.stream.write_all(&snapshot_bytes).await?;
        self.stream.flush().await?;
        info!(
            "Sent snapshot ({} bytes) to replica {}.",
            snapshot_bytes.len(),
            self.addr
        );

        self.mark_online();
        self.stream_live_updates(sync_start_offset).await;
        Ok(())
    }

    fn mark_online(&self) {
        if let Some(mut entry) = self.state.replica_states.get_mut(&self.addr) {
            entry.value_mut().sync_state = ReplicaSyncState::Online;
        } else {
            // PSYNC without a prior REPLCONF handshake; register with defaults.
            self.state.replica_states.insert(
                self.addr,
                ReplicaStateInfo {
                    sync_state: ReplicaSyncState::Online,
                    listening_port: self.addr.port(),
                    priority: 100,
                    ack_offset: 0,
                    last_ack_time: std::time::Instant::now(),
                },
            );
        }
    }

    /// Streams live commands to a now-synchronized replica while consuming
    /// `REPLCONF ACK` frames arriving on the same socket.
    async fn stream_live_updates(&mut self, mut last_known_offset: u64) {
        info!(
            "Replica {} is in sync and receiving live updates from offset {}.",
            self.addr, last_known_offset
        );

        let (read_half, mut write_half) = split(&mut self.stream);
        let mut ack_frames = FramedRead::new(read_half, RespFrameCodec);
        let mut offset_rx = self.state.replication_offset_rx.clone();

        loop {
            tokio::select! {
                changed = offset_rx.changed() => {
                    if changed.is_err() {
                        warn!("Replication offset channel closed; stopping handler for {}.", self.addr);
                        return;
                    }
                    let current = *offset_rx.borrow();
                    if last_known_offset >= current {
                        continue;
                    }
                    match self.state.replication_backlog.collect_from(last_known_offset) {
                        Some(entries) => {
                            for entry in entries {
                                match Self::forward_frame(&mut write_half, &entry.frame).await {
                                    Ok(()) => {
                                        last_known_offset = entry.end_offset();
                                    }
                                    Err(e) => {
                                        warn!(
                                            "Failed to send update to replica {}: {}. Last offset: {}",
                                            self.addr, e, last_known_offset
                                        );
                                        return;
                                    }
                                }
                            }
                        }
                        None => {
                            // The backlog has moved past this replica's position;
                            // closing forces it to reconnect for a full resync.
                            warn!(
                                "Lost backlog position for replica {}. Closing to force full resync.",
                                self.addr
                            );
                            return;
                        }
                    }
                }
                maybe_ack = ack_frames.next() => {
                    match maybe_ack {
                        Some(Ok(frame)) => process_ack(&self.state, self.addr, frame),
                        Some(Err(e)) => {
                            warn!("Bad frame from replica {}: {}", self.addr, e);
                            return;
                        }
                        None => {
                            info!("Replica {} closed its connection.", self.addr);
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn forward_frame(
        write_half: &mut WriteHalf<&mut S>,
        frame: &RespFrame,
    ) -> anyhow::Result<()> {
        let encoded = frame.encode_to_vec()?;
        write_half.write_all(&encoded).await?;
        Ok(())
    }
}

/// Records a `REPLCONF ACK <offset>` from the replica.
fn process_ack(state: &ServerState, addr: SocketAddr, frame: RespFrame) {
    let Ok(args) = frame.into_args() else {
        return;
    };
    if args.len() == 3
        && args[0].eq_ignore_ascii_case(b"replconf")
        && args[1].eq_ignore_ascii_case(b"ack")
        && let Ok(offset) = String::from_utf8_lossy(&args[2]).parse::<u64>()
        && let Some(mut entry) = state.replica_states.get_mut(&addr)
    {
        let info = entry.value_mut();
        info.ack_offset = info.ack_offset.max(offset);
        info.last_ack_time = std::time::Instant::now();
    }
}
