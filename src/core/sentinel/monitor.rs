// src/core/sentinel/monitor.rs

//! The monitoring core of the sentinel: liveness probes for the master and
//! its replicas, replica discovery through `INFO replication`, and the
//! randomized election timer that turns this sentinel into a candidate when
//! the master stays subjectively down.

use super::client::SentinelClient;
use super::election;
use super::failover;
use super::state::{InstanceRole, MonitoredInstance, SentinelState};
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Probe cadence for the master.
const MASTER_PROBE_INTERVAL: Duration = Duration::from_secs(1);
/// Probe cadence for replicas.
const REPLICA_PROBE_INTERVAL: Duration = Duration::from_secs(2);
/// How often the master's `INFO replication` is polled for replica discovery.
const INFO_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Draws an election timeout uniformly from `[down_after, 2 * down_after]`.
/// Randomization staggers candidates so the first detector usually wins.
pub fn random_election_timeout(down_after: Duration) -> Duration {
    let base_ms = down_after.as_millis().max(1) as u64;
    let ms = rand::thread_rng().gen_range(base_ms..=base_ms * 2);
    Duration::from_millis(ms)
}

/// Runs the monitoring loops for the configured master.
pub struct SentinelMonitor {
    state: Arc<SentinelState>,
    /// Signals a successful master probe; the election timer resets on it.
    heartbeat_tx: watch::Sender<()>,
}

impl SentinelMonitor {
    pub fn new(state: Arc<SentinelState>) -> Self {
        let (heartbeat_tx, _) = watch::channel(());
        Self {
            state,
            heartbeat_tx,
        }
    }

    /// Spawns all monitor sub-tasks and runs until shutdown.
    pub async fn run(self, shutdown_tx: &broadcast::Sender<()>) {
        info!(
            "Monitor for master '{}' at {}:{} started (down-after {:?}, quorum {}).",
            self.state.config.master_name,
            self.state.config.master_host,
            self.state.config.master_port,
            self.state.config.down_after,
            self.state.config.quorum,
        );

        let mut tasks = JoinSet::new();

        let state = self.state.clone();
        let heartbeat = self.heartbeat_tx.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tasks.spawn(async move {
            tokio::select! {
                _ = run_master_probe_loop(state, heartbeat) => {}
                _ = shutdown.recv() => {}
            }
        });

        let state = self.state.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tasks.spawn(async move {
            tokio::select! {
                _ = run_replica_probe_loop(state) => {}
                _ = shutdown.recv() => {}
            }
        });

        let state = self.state.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tasks.spawn(async move {
            tokio::select! {
                _ = run_info_poll_loop(state) => {}
                _ = shutdown.recv() => {}
            }
        });

        let state = self.state.clone();
        let heartbeat_rx = self.heartbeat_tx.subscribe();
        let mut shutdown = shutdown_tx.subscribe();
        tasks.spawn(async move {
            tokio::select! {
                _ = run_election_timer(state, heartbeat_rx) => {}
                _ = shutdown.recv() => {}
            }
        });

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!("A monitor sub-task ended abnormally: {}", e);
            }
        }
    }
}

/// Opens a TCP connection with the probe deadline, sends `PING`, and treats
/// any RESP simple-string reply as healthy.
async fn probe_instance(addr: &str) -> bool {
    match SentinelClient::connect(addr).await {
        Ok(mut client) => client.ping().await.is_ok(),
        Err(_) => false,
    }
}

async fn run_master_probe_loop(state: Arc<SentinelState>, heartbeat_tx: watch::Sender<()>) {
    let mut tick = tokio::time::interval(MASTER_PROBE_INTERVAL);
    loop {
        tick.tick().await;
        let addr = {
            let master = state.master.lock();
            master.addr()
        };
        let ok = probe_instance(&addr).await;
        {
            let mut master = state.master.lock();
            let was_down = master.down_flag;
            master.mark_probe(ok);
            if ok && was_down {
                info!("Master '{}' ({}) is back online.", state.config.master_name, addr);
            } else if !ok && !was_down {
                warn!(
                    "Master '{}' ({}) failed a probe; marking down.",
                    state.config.master_name, addr
                );
            }
        }
        if ok {
            // Heartbeat reset: a healthy master postpones any election.
            let _ = heartbeat_tx.send(());
        }
    }
}

async fn run_replica_probe_loop(state: Arc<SentinelState>) {
    let mut tick = tokio::time::interval(REPLICA_PROBE_INTERVAL);
    loop {
        tick.tick().await;
        let addrs: Vec<String> = {
            let replicas = state.replicas.lock();
            replicas.keys().cloned().collect()
        };
        for addr in addrs {
            let ok = probe_instance(&addr).await;
            let mut replicas = state.replicas.lock();
            if let Some(replica) = replicas.get_mut(&addr) {
                let was_down = replica.down_flag;
                replica.mark_probe(ok);
                if ok && was_down {
                    info!("Replica {} is back online.", addr);
                } else if !ok && !was_down {
                    debug!("Replica {} failed a probe; marking down.", addr);
                }
            }
        }
    }
}

/// Polls the master's `INFO replication` to discover replicas and refresh
/// their offsets and priorities. Paused while a failover is rewriting the
/// topology.
async fn run_info_poll_loop(state: Arc<SentinelState>) {
    let mut tick = tokio::time::interval(INFO_POLL_INTERVAL);
    loop {
        tick.tick().await;
        if state.failover_in_progress.load(Ordering::SeqCst) {
            continue;
        }
        let (host, port) = state.master_addr();
        let addr = format!("{host}:{port}");
        let Ok(mut client) = SentinelClient::connect(&addr).await else {
            continue;
        };
        let Ok(info_text) = client.info_replication().await else {
            continue;
        };
        apply_master_info(&state, &info_text);
    }
}

/// A replica line parsed out of the master's `INFO replication` output.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaLine {
    pub host: String,
    pub port: u16,
    pub offset: u64,
    pub priority: u32,
    pub online: bool,
}

/// Parses the `slaveN:ip=…,port=…,state=…,offset=…,priority=…` lines of an
/// `INFO replication` reply.
pub fn parse_replica_lines(info: &str) -> Vec<ReplicaLine> {
    let mut out = Vec::new();
    for line in info.lines() {
        let line = line.trim();
        if !line.starts_with("slave") {
            continue;
        }
        let Some((label, fields)) = line.split_once(':') else {
            continue;
        };
        // Only slaveN lines carry the per-replica field list.
        if !label[5..].chars().all(|c| c.is_ascii_digit()) || label.len() == 5 {
            continue;
        }
        let mut host = None;
        let mut port = None;
        let mut offset = 0u64;
        let mut priority = 100u32;
        let mut online = true;
        for field in fields.split(',') {
            let Some((key, value)) = field.split_once('=') else {
                continue;
            };
            match key {
                "ip" => host = Some(value.to_string()),
                "port" => port = value.parse::<u16>().ok(),
                "offset" => offset = value.parse().unwrap_or(0),
                "priority" => priority = value.parse().unwrap_or(100),
                "state" => online = value == "online",
                _ => {}
            }
        }
        if let (Some(host), Some(port)) = (host, port) {
            out.push(ReplicaLine {
                host,
                port,
                offset,
                priority,
                online,
            });
        }
    }
    out
}

/// Folds a parsed `INFO replication` reply into the replica map: new
/// replicas are added, known ones get fresh offsets and priorities, and
/// entries that vanished from the master's view are dropped unless they are
/// down (a down entry may be the demoted old master, kept for bookkeeping).
fn apply_master_info(state: &Arc<SentinelState>, info: &str) {
    let lines = parse_replica_lines(info);
    let mut discovered: HashSet<String> = HashSet::new();

    let mut replicas = state.replicas.lock();
    for line in lines {
        let addr = format!("{}:{}", line.host, line.port);
        discovered.insert(addr.clone());
        let entry = replicas.entry(addr).or_insert_with(|| {
            info!("Discovered replica {}:{} for master '{}'.", line.host, line.port, state.config.master_name);
            MonitoredInstance::new(line.host.clone(), line.port, InstanceRole::Replica)
        });
        entry.repl_offset = line.offset;
        entry.priority = line.priority;
    }
    replicas.retain(|addr, instance| discovered.contains(addr) || instance.down_flag);
}

/// The election timer: a randomized timeout in `[down_after, 2·down_after]`,
/// reset on every successful master probe. Firing while the master is SDOWN
/// makes this sentinel a candidate; winning the election runs the failover.
async fn run_election_timer(state: Arc<SentinelState>, mut heartbeat_rx: watch::Receiver<()>) {
    loop {
        let timeout = random_election_timeout(state.config.down_after);
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {
                if !state.master_is_sdown() {
                    continue;
                }
                if state.failover_in_progress.load(Ordering::SeqCst) {
                    continue;
                }
                if let Some(epoch) = election::run_election(&state).await {
                    failover::start_failover(state.clone(), epoch).await;
                }
            }
            result = heartbeat_rx.changed() => {
                if result.is_err() {
                    return;
                }
                // Heartbeat: restart the loop with a fresh random timeout.
            }
        }
    }
}
