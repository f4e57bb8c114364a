// src/core/replication/mod.rs

//! The replication subsystem: the role state machine, the primary-side
//! backlog feeder and per-replica handlers, and the replica-side worker.

use crate::core::state::ServerState;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{info, warn};

pub mod backlog;
pub mod handler;
pub mod worker;

/// Spawns the replication tasks into the server's task set.
///
/// The backlog feeder runs for the process lifetime: a primary always feeds
/// accepted writes into the backlog, and the feeder is simply idle on a
/// replica because the bypass path never publishes to the event bus. The
/// supervisor watches role changes and runs the replica worker only while a
/// primary is configured.
pub fn spawn_replication(state: &Arc<ServerState>, tasks: &mut JoinSet<()>) {
    let feeder_state = state.clone();
    let feeder_shutdown = state.shutdown_tx.subscribe();
    tasks.spawn(run_backlog_feeder(feeder_state, feeder_shutdown));

    let supervisor_state = state.clone();
    let supervisor_shutdown = state.shutdown_tx.subscribe();
    tasks.spawn(run_replica_supervisor(supervisor_state, supervisor_shutdown));
}

/// Listens to the event bus and feeds write commands into the replication
/// backlog, assigning each its byte offset in the replication stream.
async fn run_backlog_feeder(state: Arc<ServerState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut event_rx = state.event_bus.subscribe_for_replication();
    info!("Replication backlog feeder task is running.");

    loop {
        tokio::select! {
            result = event_rx.recv() => {
                match result {
                    Ok(frame) => {
                        let Ok(encoded) = frame.encode_to_vec() else {
                            continue;
                        };
                        let frame_len = encoded.len() as u64;
                        // Atomically claim this command's slot in the stream.
                        let command_offset = state
                            .replication
                            .replication_info
                            .master_repl_offset
                            .fetch_add(frame_len, Ordering::SeqCst);
                        state
                            .replication_backlog
                            .append(command_offset, frame, frame_len as usize);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(
                            "Replication backlog feeder lagged; {} events dropped. Replicas may need a full resync.",
                            n
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Event bus closed. Replication backlog feeder shutting down.");
                        return;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Replication backlog feeder shutting down.");
                return;
            }
        }
    }
}

/// Runs the replica worker whenever this server is configured as a replica,
/// and idles otherwise. `REPLICAOF` role changes wake it up in both
/// directions.
async fn run_replica_supervisor(state: Arc<ServerState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut role_change_rx = state.role_change_tx.subscribe();
    loop {
        if state.is_replica() {
            let worker = worker::ReplicaWorker::new(state.clone());
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = worker.run() => {
                    // The worker only returns when the role flipped to primary.
                }
            }
        } else {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                result = role_change_rx.recv() => {
                    if result.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
