// src/core/sentinel/failover.rs

//! The promotion choreography a newly elected leader runs: pick the best
//! replica, promote it with `REPLICAOF NO ONE`, repoint the remaining
//! replicas, demote the old master in our books, and announce the switch.

use super::client::SentinelClient;
use super::state::{InstanceRole, MasterChange, MonitoredInstance, SentinelState};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{info, warn};

/// The channel on which completed failovers are announced.
pub const FAILOVER_CHANNEL: &str = "__sentinel__:failover";

/// The promotion score: priority dominates, replication offset breaks ties
/// within a priority class.
fn promotion_score(instance: &MonitoredInstance) -> u64 {
    instance.priority as u64 * 1_000_000 + instance.repl_offset
}

/// Chooses the replica to promote: the highest score among replicas that are
/// not down; score ties go to the lexicographically smallest `host:port`.
/// Returns `None` exactly when every replica is down (or none exist).
pub fn select_best_replica(
    replicas: &std::collections::BTreeMap<String, MonitoredInstance>,
) -> Option<MonitoredInstance> {
    replicas
        .values()
        .filter(|replica| !replica.down_flag)
        .max_by(|a, b| {
            promotion_score(a)
                .cmp(&promotion_score(b))
                // BTreeMap iterates in ascending address order, so on equal
                // scores `max_by` keeps the first (smallest) address; make
                // that explicit rather than relying on iteration order.
                .then_with(|| b.addr().cmp(&a.addr()))
        })
        .cloned()
}

/// Runs the failover for the monitored master. The caller has already won
/// the election for `epoch`.
pub async fn start_failover(state: Arc<SentinelState>, epoch: u64) {
    // Single-writer guard: only one promotion at a time per master.
    if state
        .failover_in_progress
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        info!("Failover already in progress; skipping attempt at epoch {epoch}.");
        return;
    }

    let outcome = run_failover(&state, epoch).await;
    state.failover_in_progress.store(false, Ordering::SeqCst);

    match outcome {
        Ok(()) => {
            *state.last_failover_time.lock() = Some(Instant::now());
        }
        Err(reason) => {
            warn!(
                "Failover for master '{}' at epoch {} aborted: {}",
                state.config.master_name, epoch, reason
            );
        }
    }
}

async fn run_failover(state: &Arc<SentinelState>, epoch: u64) -> Result<(), String> {
    let master_name = state.config.master_name.clone();
    let (old_host, old_port) = state.master_addr();

    // Respect the failover timeout: a recently completed failover means the
    // cluster is still settling.
    if let Some(last) = *state.last_failover_time.lock()
        && last.elapsed() < state.config.failover_timeout
    {
        return Err("a failover completed too recently".into());
    }

    // --- Step 1: select the best replica to promote ---
    let candidate = {
        let replicas = state.replicas.lock();
        select_best_replica(&replicas)
    };
    let Some(candidate) = candidate else {
        return Err("no suitable replica found to promote".into());
    };
    let candidate_addr = candidate.addr();
    info!(
        epoch,
        "Selected replica {} (priority {}, offset {}) as promotion candidate for master '{}'.",
        candidate_addr, candidate.priority, candidate.repl_offset, master_name
    );

    // --- Step 2: promote via REPLICAOF NO ONE; any failure aborts before
    // any other replica is touched (no partial promotion). ---
    let mut client = SentinelClient::connect(&candidate_addr)
        .await
        .map_err(|e| format!("cannot reach promotion candidate {candidate_addr}: {e}"))?;
    client
        .replicaof_no_one()
        .await
        .map_err(|e| format!("REPLICAOF NO ONE to {candidate_addr} failed: {e}"))?;
    info!("Promoted {} to master for '{}'.", candidate_addr, master_name);

    // --- Step 3: rewrite our master reference to the promoted address. ---
    {
        let mut master = state.master.lock();
        master.host = candidate.host.clone();
        master.port = candidate.port;
        master.down_flag = false;
        master.down_since = None;
        master.last_probe_ok = true;
        master.repl_offset = candidate.repl_offset;
    }

    // --- Step 4: repoint every remaining non-down replica. Failures are
    // logged, not rolled back: stragglers converge when they come back. ---
    let others: Vec<String> = {
        let replicas = state.replicas.lock();
        replicas
            .values()
            .filter(|r| !r.down_flag && r.addr() != candidate_addr)
            .map(|r| r.addr())
            .collect()
    };
    for replica_addr in others {
        match SentinelClient::connect(&replica_addr).await {
            Ok(mut replica_client) => {
                if let Err(e) = replica_client
                    .replicaof(&candidate.host, candidate.port)
                    .await
                {
                    warn!(
                        "Failed to reconfigure replica {} to follow {}: {}",
                        replica_addr, candidate_addr, e
                    );
                } else {
                    info!("Reconfigured replica {} to follow {}.", replica_addr, candidate_addr);
                }
            }
            Err(e) => {
                warn!("Could not connect to replica {}: {}", replica_addr, e);
            }
        }
    }

    // --- Step 5: the promoted entry leaves the replica set; the old master
    // enters it, flagged down until it proves otherwise. ---
    {
        let mut replicas = state.replicas.lock();
        replicas.remove(&candidate_addr);
        let mut demoted =
            MonitoredInstance::new(old_host.clone(), old_port, InstanceRole::Replica);
        demoted.down_flag = true;
        demoted.down_since = Some(Instant::now());
        replicas.insert(demoted.addr(), demoted);
    }

    // --- Step 6: announce the switch and invoke the callback. ---
    let event = format!(
        "+switch-master {} {} {} {} {}",
        master_name, old_host, old_port, candidate.host, candidate.port
    );
    match SentinelClient::connect(&candidate_addr).await {
        Ok(mut publish_client) => {
            if let Err(e) = publish_client.publish(FAILOVER_CHANNEL, &event).await {
                warn!("Failed to publish switch-master event: {}", e);
            }
        }
        Err(e) => warn!("Could not connect to publish switch-master event: {}", e),
    }

    if let Some(callback) = &state.on_master_change {
        callback(MasterChange {
            master_name: master_name.clone(),
            old_host,
            old_port,
            new_host: candidate.host.clone(),
            new_port: candidate.port,
        });
    }

    info!(
        epoch,
        "Failover for master '{}' completed. New master is {}.", master_name, candidate_addr
    );
    Ok(())
}
