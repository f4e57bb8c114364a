// src/core/state.rs

//! The shared state of a running data server, plus the replication-role
//! bookkeeping that the INFO command, the sentinel, and the replication
//! subsystem all read.

use crate::core::events::EventBus;
use crate::core::persistence::aof::AofHandle;
use crate::core::pubsub::PubSubManager;
use crate::core::replication::backlog::ReplicationBacklog;
use crate::core::storage::db::Db;
use crate::core::cluster::ClusterState;
use crate::config::Config;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::{broadcast, watch};

/// The synchronization state of a replica connected to this primary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReplicaSyncState {
    /// The replica is waiting for a full resynchronization (snapshot stream).
    AwaitingFullSync,
    /// The replica is online and receiving a live stream of commands.
    Online,
}

/// Runtime information about a connected replica, tracked by the primary.
#[derive(Debug, Clone)]
pub struct ReplicaStateInfo {
    pub sync_state: ReplicaSyncState,
    /// The port the replica listens on for its own clients, announced via
    /// `REPLCONF listening-port`.
    pub listening_port: u16,
    /// Failover priority announced via `REPLCONF priority`.
    pub priority: u32,
    /// The last replication offset acknowledged by the replica.
    pub ack_offset: u64,
    pub last_ack_time: Instant,
}

/// Information about this server's role as a primary in replication.
#[derive(Debug)]
pub struct ReplicationInfo {
    /// The unique run ID of this primary.
    pub master_replid: String,
    /// The current global replication offset for this primary.
    pub master_repl_offset: AtomicU64,
}

/// Information about this server's role as a replica.
#[derive(Debug, Clone)]
pub struct ReplicaInfo {
    pub master_host: String,
    pub master_port: u16,
    /// The replication id of the primary this replica last synced from,
    /// presented in `PSYNC` to request a partial resync.
    pub master_replid: String,
    /// The replication offset this replica has processed.
    pub processed_offset: u64,
    /// Whether the link to the primary is currently established.
    pub link_up: bool,
}

/// The central struct holding all replication-related state.
#[derive(Debug)]
pub struct ReplicationState {
    pub replication_info: ReplicationInfo,
    /// `Some` exactly when this server is a replica.
    pub replica_info: Mutex<Option<ReplicaInfo>>,
}

impl ReplicationState {
    pub fn new(master_replid: String) -> Self {
        Self {
            replication_info: ReplicationInfo {
                master_replid,
                master_repl_offset: AtomicU64::new(0),
            },
            replica_info: Mutex::new(None),
        }
    }

    pub fn get_replication_offset(&self) -> u64 {
        self.replication_info
            .master_repl_offset
            .load(Ordering::SeqCst)
    }
}

/// The top-level shared state for one data-server process.
#[derive(Debug)]
pub struct ServerState {
    pub config: Config,
    pub db: Db,
    pub pubsub: PubSubManager,
    pub event_bus: EventBus,
    /// `Some` when AOF persistence is enabled.
    pub aof: Option<AofHandle>,
    pub replication: ReplicationState,
    /// Per-replica runtime state, keyed by the replica's socket address.
    pub replica_states: DashMap<SocketAddr, ReplicaStateInfo>,
    pub replication_backlog: ReplicationBacklog,
    /// Observes the primary's advancing replication offset.
    pub replication_offset_rx: watch::Receiver<u64>,
    /// `Some` when cluster mode is enabled.
    pub cluster: Option<Arc<ClusterState>>,
    /// Set while this server is a replica; writes are rejected.
    pub is_read_only: AtomicBool,
    /// Fired on every `REPLICAOF` role change so the replication supervisor
    /// reacts.
    pub role_change_tx: broadcast::Sender<()>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub client_count: AtomicUsize,
}

impl ServerState {
    pub fn new(
        config: Config,
        aof: Option<AofHandle>,
        cluster: Option<Arc<ClusterState>>,
        run_id: String,
    ) -> Arc<Self> {
        let backlog = ReplicationBacklog::new();
        let offset_rx = backlog.offset_watch();
        let (role_change_tx, _) = broadcast::channel(8);
        let (shutdown_tx, _) = broadcast::channel(8);

        let is_replica = config.replication.is_replica();
        let replication = ReplicationState::new(run_id);
        if let crate::config::ReplicationConfig::Replica {
            primary_host,
            primary_port,
        } = &config.replication
        {
            *replication.replica_info.lock() = Some(ReplicaInfo {
                master_host: primary_host.clone(),
                master_port: *primary_port,
                master_replid: String::new(),
                processed_offset: 0,
                link_up: false,
            });
        }

        Arc::new(Self {
            config,
            db: Db::new(),
            pubsub: PubSubManager::new(),
            event_bus: EventBus::new(),
            aof,
            replication,
            replica_states: DashMap::new(),
            replication_backlog: backlog,
            replication_offset_rx: offset_rx,
            cluster,
            is_read_only: AtomicBool::new(is_replica),
            role_change_tx,
            shutdown_tx,
            client_count: AtomicUsize::new(0),
        })
    }

    /// True while this server is a replica.
    pub fn is_replica(&self) -> bool {
        self.replication.replica_info.lock().is_some()
    }

    /// Demotes this server to a replica of `host:port` and signals the
    /// replication supervisor.
    pub fn set_role_replica(&self, host: String, port: u16) {
        {
            let mut replica_info = self.replication.replica_info.lock();
            *replica_info = Some(ReplicaInfo {
                master_host: host,
                master_port: port,
                master_replid: String::new(),
                processed_offset: 0,
                link_up: false,
            });
        }
        self.is_read_only.store(true, Ordering::SeqCst);
        let _ = self.role_change_tx.send(());
    }

    /// Promotes this server to a primary (`REPLICAOF NO ONE`): the replica
    /// link state is cleared, the read-only guard drops, and the replication
    /// offset is retained so the first accepted write continues from it.
    pub fn set_role_master(&self) {
        {
            let mut replica_info = self.replication.replica_info.lock();
            *replica_info = None;
        }
        self.is_read_only.store(false, Ordering::SeqCst);
        let _ = self.role_change_tx.send(());
    }

    /// Builds the INFO reply. Only the `server` and `replication` sections
    /// exist; an unknown section yields an empty reply.
    pub fn info_string(&self, section: Option<&str>) -> String {
        let mut out = String::new();
        let want = |name: &str| section.is_none() || section == Some(name);

        if want("server") {
            out.push_str("# Server\r\n");
            out.push_str(&format!("jasperdb_version:{}\r\n", env!("CARGO_PKG_VERSION")));
            out.push_str(&format!("run_id:{}\r\n", self.replication.replication_info.master_replid));
            out.push_str(&format!("tcp_port:{}\r\n", self.config.port));
            out.push_str("\r\n");
        }

        if want("replication") {
            out.push_str("# Replication\r\n");
            let replica_info = self.replication.replica_info.lock().clone();
            match replica_info {
                None => {
                    out.push_str("role:master\r\n");
                    out.push_str(&format!(
                        "master_replid:{}\r\n",
                        self.replication.replication_info.master_replid
                    ));
                    out.push_str(&format!(
                        "master_repl_offset:{}\r\n",
                        self.replication.get_replication_offset()
                    ));
                    out.push_str(&format!("connected_slaves:{}\r\n", self.replica_states.len()));
                    for (i, entry) in self.replica_states.iter().enumerate() {
                        let info = entry.value();
                        let state = match info.sync_state {
                            ReplicaSyncState::Online => "online",
                            ReplicaSyncState::AwaitingFullSync => "sync_in_progress",
                        };
                        out.push_str(&format!(
                            "slave{}:ip={},port={},state={},offset={},priority={}\r\n",
                            i,
                            entry.key().ip(),
                            info.listening_port,
                            state,
                            info.ack_offset,
                            info.priority,
                        ));
                    }
                }
                Some(replica) => {
                    out.push_str("role:slave\r\n");
                    out.push_str(&format!("master_host:{}\r\n", replica.master_host));
                    out.push_str(&format!("master_port:{}\r\n", replica.master_port));
                    out.push_str(&format!(
                        "master_link_status:{}\r\n",
                        if replica.link_up { "up" } else { "down" }
                    ));
                    out.push_str(&format!(
                        "master_replid:{}\r\n",
                        self.replication.replication_info.master_replid
                    ));
                    out.push_str(&format!("slave_repl_offset:{}\r\n", replica.processed_offset));
                    out.push_str(&format!(
                        "slave_priority:{}\r\n",
                        self.config.replica_priority
                    ));
                }
            }
            out.push_str("\r\n");
        }

        out
    }
}

/// Generates a unique 40-character hexadecimal run ID.
pub fn generate_run_id() -> String {
    let mut bytes = [0u8; 20];
    // The fallback only triggers if the OS entropy source is unavailable.
    if getrandom::fill(&mut bytes).is_err() {
        let pid = std::process::id().to_le_bytes();
        bytes[..4].copy_from_slice(&pid);
    }
    hex::encode(bytes)
}
