// src/core/sentinel/election.rs

//! Epoch-scoped leader election among peer sentinels.
//!
//! A sentinel whose election timer fires while the master is subjectively
//! down becomes a candidate: it bumps its epoch, votes for itself, and asks
//! every connected peer for a vote via `SENTINEL IS-MASTER-DOWN-BY-ADDR`.
//! Epoch monotonicity makes the protocol race-free: a vote granted in an
//! epoch cannot be stolen by a concurrent candidate in the same epoch, and a
//! stale candidate is rejected outright.

use super::client::{SentinelClient, VoteReply};
use super::state::{SentinelState, SentinelId, VotingState};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// How long a candidate aggregates vote replies before giving up.
const VOTE_AGGREGATION_WINDOW: Duration = Duration::from_secs(3);

/// An incoming vote request, as carried by `SENTINEL IS-MASTER-DOWN-BY-ADDR`.
#[derive(Debug, Clone, PartialEq)]
pub struct VoteRequest {
    pub master_host: String,
    pub master_port: u16,
    pub epoch: u64,
    pub candidate_id: SentinelId,
}

/// Applies the peer vote rules to a request, mutating `voting` per protocol.
///
/// `master_matches` says whether the addressed master is the one this
/// sentinel monitors; `master_sdown` is this sentinel's own view of it.
/// The rules, in order:
///
/// 1. A request from a stale epoch is rejected, reporting our vote and epoch.
/// 2. A request from a newer epoch fast-forwards our epoch and clears the vote.
/// 3. Within the already-voted epoch, only the candidate we voted for is
///    re-granted; everyone else is rejected.
/// 4. A first vote in an epoch is granted only if the addressed master is the
///    one we monitor and we also regard it as down.
pub fn handle_vote_request(
    voting: &mut VotingState,
    master_matches: bool,
    master_sdown: bool,
    request: &VoteRequest,
) -> VoteReply {
    if request.epoch < voting.current_epoch {
        return VoteReply {
            agrees: false,
            leader: voting.voted_for.clone(),
            epoch: voting.current_epoch,
        };
    }

    if request.epoch > voting.current_epoch {
        voting.current_epoch = request.epoch;
        voting.voted_epoch = 0;
        voting.voted_for = None;
    }

    if voting.voted_epoch == request.epoch {
        // Already voted in this epoch: grant only the same candidate.
        let agrees = voting.voted_for.as_deref() == Some(request.candidate_id.as_str());
        return VoteReply {
            agrees,
            leader: voting.voted_for.clone(),
            epoch: voting.current_epoch,
        };
    }

    if master_matches && master_sdown {
        voting.voted_epoch = request.epoch;
        voting.voted_for = Some(request.candidate_id.clone());
        VoteReply {
            agrees: true,
            leader: Some(request.candidate_id.clone()),
            epoch: request.epoch,
        }
    } else {
        VoteReply {
            agrees: false,
            leader: voting.voted_for.clone(),
            epoch: voting.current_epoch,
        }
    }
}

/// Enters candidacy for the next epoch: bumps the epoch and self-votes.
/// The critical section covers only the voting-state update.
pub fn begin_candidacy(state: &SentinelState) -> u64 {
    let mut voting = state.voting.lock();
    voting.current_epoch += 1;
    voting.voted_epoch = voting.current_epoch;
    voting.voted_for = Some(state.my_id.clone());
    voting.current_epoch
}

/// Runs one election round. Returns the epoch on a win, `None` otherwise.
///
/// The candidate broadcasts to every connected peer in parallel and
/// aggregates replies for up to the aggregation window; leadership requires
/// `agrees` (including the self-vote) to reach the quorum.
pub async fn run_election(state: &Arc<SentinelState>) -> Option<u64> {
    let epoch = begin_candidacy(state);
    let (master_host, master_port) = state.master_addr();
    let quorum = state.config.quorum;

    let peers: Vec<SentinelId> = state
        .connected_peers
        .iter()
        .map(|entry| entry.key().clone())
        .collect();

    info!(
        epoch,
        peers = peers.len(),
        "Master '{}' is subjectively down; starting leader election.",
        state.config.master_name
    );

    let mut requests = JoinSet::new();
    for peer_addr in peers {
        let master_host = master_host.clone();
        let candidate_id = state.my_id.clone();
        requests.spawn(async move {
            let reply =
                request_vote(&peer_addr, &master_host, master_port, epoch, &candidate_id).await;
            (peer_addr, reply)
        });
    }

    // Initial self-vote.
    let mut agrees = 1usize;

    let deadline = tokio::time::Instant::now() + VOTE_AGGREGATION_WINDOW;
    while agrees < quorum {
        let joined = tokio::select! {
            joined = requests.join_next() => joined,
            _ = tokio::time::sleep_until(deadline) => {
                debug!("Vote aggregation window elapsed at epoch {}.", epoch);
                break;
            }
        };
        let Some(joined) = joined else {
            break; // All peers have replied.
        };
        match joined {
            Ok((peer, Ok(reply))) => {
                if reply.agrees {
                    agrees += 1;
                    debug!("Peer {} granted vote in epoch {}.", peer, epoch);
                } else {
                    debug!(
                        "Peer {} rejected vote in epoch {} (leader {:?}, epoch {}).",
                        peer, epoch, reply.leader, reply.epoch
                    );
                    // A peer that has seen a newer epoch fast-forwards us.
                    let mut voting = state.voting.lock();
                    if reply.epoch > voting.current_epoch {
                        voting.current_epoch = reply.epoch;
                        voting.voted_epoch = 0;
                        voting.voted_for = None;
                    }
                }
            }
            Ok((peer, Err(e))) => {
                debug!("Vote request to peer {} failed: {}", peer, e);
            }
            Err(e) => {
                warn!("Vote request task panicked: {}", e);
            }
        }
    }
    requests.abort_all();

    if agrees >= quorum {
        info!(
            "Won leader election for master '{}' at epoch {} with {} votes (quorum {}).",
            state.config.master_name, epoch, agrees, quorum
        );
        Some(epoch)
    } else {
        info!(
            "Lost leader election for master '{}' at epoch {} with {} votes (quorum {}).",
            state.config.master_name, epoch, agrees, quorum
        );
        None
    }
}

/// Sends one vote request over a fresh connection, with the RPC deadlines.
async fn request_vote(
    peer_addr: &str,
    master_host: &str,
    master_port: u16,
    epoch: u64,
    candidate_id: &str,
) -> anyhow::Result<VoteReply> {
    let mut client = SentinelClient::connect(peer_addr).await?;
    client
        .is_master_down_by_addr(master_host, master_port, epoch, candidate_id)
        .await
}
