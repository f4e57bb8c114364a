// src/core/sentinel/peers.rs

//! Outbound connections to peer sentinels, one supervised loop per
//! configured address: exponential reconnect backoff, a periodic keepalive
//! `PING`, and a best-effort master-address sanity query. Peers sit in the
//! connected set while their link is healthy; that set is the vote-broadcast
//! target during elections.

use super::client::SentinelClient;
use super::state::{PeerInfo, SentinelState};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Spawns one supervisor per configured peer address.
pub fn spawn_peer_supervisors(
    state: &Arc<SentinelState>,
    shutdown_tx: &broadcast::Sender<()>,
    tasks: &mut JoinSet<()>,
) {
    for peer_addr in &state.config.sentinel_addrs {
        if *peer_addr == state.my_id {
            continue;
        }
        let state = state.clone();
        let peer_addr = peer_addr.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tasks.spawn(async move {
            tokio::select! {
                _ = supervise_peer(state, peer_addr) => {}
                _ = shutdown_rx.recv() => {}
            }
        });
    }
}

/// The supervised connection loop for one peer.
async fn supervise_peer(state: Arc<SentinelState>, peer_addr: String) {
    let mut reconnect_delay = INITIAL_RECONNECT_DELAY;
    loop {
        match SentinelClient::connect(&peer_addr).await {
            Ok(client) => {
                info!("Connected to peer sentinel {}", peer_addr);
                reconnect_delay = INITIAL_RECONNECT_DELAY;
                state.connected_peers.insert(
                    peer_addr.clone(),
                    PeerInfo {
                        addr: peer_addr.clone(),
                        connected_since: Instant::now(),
                    },
                );

                let reason = keepalive_loop(&state, client).await;
                state.connected_peers.remove(&peer_addr);
                warn!(
                    "Link to peer sentinel {} lost: {}. Reconnecting in {:?}.",
                    peer_addr, reason, reconnect_delay
                );
            }
            Err(e) => {
                debug!(
                    "Cannot reach peer sentinel {}: {}. Retrying in {:?}.",
                    peer_addr, e, reconnect_delay
                );
            }
        }

        tokio::time::sleep(reconnect_delay).await;
        reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY);
    }
}

/// Keeps one peer link warm until it fails, returning the failure reason.
async fn keepalive_loop(state: &Arc<SentinelState>, mut client: SentinelClient) -> String {
    let mut tick = tokio::time::interval(KEEPALIVE_INTERVAL);
    // The first tick completes immediately; skip it so the fresh connection
    // is not pinged twice in a row.
    tick.tick().await;

    loop {
        tick.tick().await;

        match tokio::time::timeout(KEEPALIVE_TIMEOUT, client.ping()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return format!("keepalive ping failed: {e}"),
            Err(_) => return "keepalive ping timed out".to_string(),
        }

        // Best-effort sanity check: disagreement is logged, never fatal.
        match client
            .get_master_addr_by_name(&state.config.master_name)
            .await
        {
            Ok(Some((host, port))) => {
                let (my_host, my_port) = state.master_addr();
                if host != my_host || port != my_port {
                    debug!(
                        "Peer reports master '{}' at {}:{} while we track {}:{}.",
                        state.config.master_name, host, port, my_host, my_port
                    );
                }
            }
            Ok(None) => {
                debug!(
                    "Peer does not know master '{}' yet.",
                    state.config.master_name
                );
            }
            Err(e) => return format!("sanity query failed: {e}"),
        }
    }
}
