// src/core/sentinel/state.rs

//! Data structures the sentinel uses to track the monitored master, its
//! replicas, peer sentinels, and the epoch-scoped voting state.
//!
//! Lock discipline: the master record, the replica map, and the voting state
//! are each guarded by their own mutex; no two are ever held at once, and
//! fields are copied out before any network I/O.

use super::config::SentinelConfig;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

/// The `host:port` identity of a sentinel, globally unique in a deployment.
pub type SentinelId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceRole {
    Master,
    Replica,
}

/// One monitored data-server instance: the master or one of its replicas.
#[derive(Debug, Clone)]
pub struct MonitoredInstance {
    pub host: String,
    pub port: u16,
    pub role: InstanceRole,
    pub last_probe_time: Option<Instant>,
    pub last_probe_ok: bool,
    pub down_flag: bool,
    /// Set exactly when `down_flag` is set.
    pub down_since: Option<Instant>,
    /// Failover priority in `[0, 1_000_000]`; higher wins.
    pub priority: u32,
    pub repl_offset: u64,
}

impl MonitoredInstance {
    pub fn new(host: String, port: u16, role: InstanceRole) -> Self {
        Self {
            host,
            port,
            role,
            last_probe_time: None,
            last_probe_ok: false,
            down_flag: false,
            down_since: None,
            priority: 100,
            repl_offset: 0,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Records the outcome of a liveness probe. The first failing probe sets
    /// the down flag; any success clears it.
    pub fn mark_probe(&mut self, ok: bool) {
        self.last_probe_time = Some(Instant::now());
        self.last_probe_ok = ok;
        if ok {
            self.down_flag = false;
            self.down_since = None;
        } else if self.down_since.is_none() {
            self.down_flag = true;
            self.down_since = Some(Instant::now());
        }
    }

    /// Subjectively down: unreachable for at least `down_after`.
    pub fn is_sdown(&self, down_after: Duration) -> bool {
        self.down_flag
            && self
                .down_since
                .is_some_and(|since| since.elapsed() >= down_after)
    }
}

/// Per-sentinel epoch voting state.
///
/// Invariants: `voted_epoch <= current_epoch`, `current_epoch` never
/// decreases, and `voted_epoch == current_epoch` implies `voted_for` is set.
#[derive(Debug, Clone, Default)]
pub struct VotingState {
    pub current_epoch: u64,
    pub voted_epoch: u64,
    pub voted_for: Option<SentinelId>,
}

impl VotingState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A peer sentinel this process has heard from.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub addr: SentinelId,
    pub connected_since: Instant,
}

/// Event payload delivered to the `on_master_change` callback after a
/// completed failover.
#[derive(Debug, Clone)]
pub struct MasterChange {
    pub master_name: String,
    pub old_host: String,
    pub old_port: u16,
    pub new_host: String,
    pub new_port: u16,
}

/// A narrow capability interface registered once at construction; there is
/// no global registry.
pub type MasterChangeCallback = Arc<dyn Fn(MasterChange) + Send + Sync>;

/// The shared state of one sentinel process.
pub struct SentinelState {
    pub my_id: SentinelId,
    pub config: SentinelConfig,
    /// The monitored master record.
    pub master: Mutex<MonitoredInstance>,
    /// Known replicas, keyed by `host:port`. A `BTreeMap` keeps iteration
    /// in lexicographic address order, which the promotion tie-break relies on.
    pub replicas: Mutex<BTreeMap<String, MonitoredInstance>>,
    pub voting: Mutex<VotingState>,
    /// Guards promotion; attempts while set return immediately.
    pub failover_in_progress: AtomicBool,
    /// Peers with a currently healthy outbound link; the vote broadcast target set.
    pub connected_peers: DashMap<SentinelId, PeerInfo>,
    /// The last time a failover completed for this master.
    pub last_failover_time: Mutex<Option<Instant>>,
    pub on_master_change: Option<MasterChangeCallback>,
}

impl std::fmt::Debug for SentinelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SentinelState")
            .field("my_id", &self.my_id)
            .field("master", &self.master)
            .field("voting", &self.voting)
            .finish_non_exhaustive()
    }
}

impl SentinelState {
    pub fn new(config: SentinelConfig, on_master_change: Option<MasterChangeCallback>) -> Arc<Self> {
        let master = MonitoredInstance::new(
            config.master_host.clone(),
            config.master_port,
            InstanceRole::Master,
        );
        Arc::new(Self {
            my_id: config.my_id(),
            master: Mutex::new(master),
            replicas: Mutex::new(BTreeMap::new()),
            voting: Mutex::new(VotingState::new()),
            failover_in_progress: AtomicBool::new(false),
            connected_peers: DashMap::new(),
            last_failover_time: Mutex::new(None),
            on_master_change,
            config,
        })
    }

    /// Copies the master's address out for lock-free I/O.
    pub fn master_addr(&self) -> (String, u16) {
        let master = self.master.lock();
        (master.host.clone(), master.port)
    }

    /// Whether the master is subjectively down right now.
    pub fn master_is_sdown(&self) -> bool {
        self.master.lock().is_sdown(self.config.down_after)
    }
}
