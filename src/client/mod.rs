// src/client/mod.rs

//! The sentinel-aware client library: discovers the current master through
//! the sentinel mesh, splits reads across replicas, and transparently
//! reconnects across failovers.

use crate::core::JasperError;
use crate::core::protocol::{RespFrame, RespFrameCodec};
use crate::core::sentinel::client::SentinelClient;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Write attempts before surfacing `MaxRetriesExceeded`.
const MAX_WRITE_RETRIES: usize = 3;
/// Connect deadline for data-server sessions.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Per-command reply deadline.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Sentinel addresses, tried sequentially during discovery.
    pub sentinel_addrs: Vec<String>,
    pub master_name: String,
    /// Background re-discovery interval; zero disables the health check.
    pub health_check_interval: Duration,
    /// Verify the master role via `INFO replication` before reads.
    pub require_strong_consistency: bool,
}

/// One framed session to a data server.
struct ServerConnection {
    addr: String,
    framed: Framed<TcpStream, RespFrameCodec>,
}

impl ServerConnection {
    async fn connect(addr: String) -> Result<Self, JasperError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| JasperError::Io(Arc::new(std::io::Error::from(std::io::ErrorKind::TimedOut))))??;
        Ok(Self {
            addr,
            framed: Framed::new(stream, RespFrameCodec),
        })
    }

    async fn request(&mut self, args: &[Bytes]) -> Result<RespFrame, JasperError> {
        self.framed
            .send(RespFrame::command(args.iter().cloned()))
            .await?;
        match tokio::time::timeout(COMMAND_TIMEOUT, self.framed.next()).await {
            Err(_) => Err(JasperError::Io(Arc::new(std::io::Error::from(
                std::io::ErrorKind::TimedOut,
            )))),
            Ok(None) => Err(JasperError::Io(Arc::new(std::io::Error::from(
                std::io::ErrorKind::UnexpectedEof,
            )))),
            Ok(Some(result)) => result,
        }
    }
}

/// A client that discovers its topology through sentinels: writes go to the
/// master, reads round-robin across replicas with master fallback.
pub struct SentinelAwareClient {
    config: ClientConfig,
    master: tokio::sync::Mutex<Option<ServerConnection>>,
    replicas: tokio::sync::Mutex<Vec<ServerConnection>>,
    round_robin: AtomicUsize,
}

impl SentinelAwareClient {
    /// Connects by discovering the master through the sentinel mesh. Starts
    /// the background health check when an interval is configured.
    pub async fn connect(config: ClientConfig) -> Result<Arc<Self>, JasperError> {
        if config.sentinel_addrs.is_empty() {
            return Err(JasperError::InvalidRequest(
                "no sentinels configured".into(),
            ));
        }
        if config.master_name.is_empty() {
            return Err(JasperError::InvalidRequest("empty master name".into()));
        }

        let client = Arc::new(Self {
            config,
            master: tokio::sync::Mutex::new(None),
            replicas: tokio::sync::Mutex::new(Vec::new()),
            round_robin: AtomicUsize::new(0),
        });
        client.rediscover().await?;

        if !client.config.health_check_interval.is_zero() {
            let weak = Arc::downgrade(&client);
            let interval = client.config.health_check_interval;
            tokio::spawn(health_check_loop(weak, interval));
        }

        Ok(client)
    }

    /// Writes a key to the master, retrying across failovers. A transport
    /// error or a `-READONLY` reply triggers re-discovery before the retry.
    pub async fn set(&self, key: &str, value: &str) -> Result<(), JasperError> {
        let args = [
            Bytes::from_static(b"SET"),
            Bytes::from(key.to_string()),
            Bytes::from(value.to_string()),
        ];

        for attempt in 1..=MAX_WRITE_RETRIES {
            match self.request_master(&args).await {
                Ok(RespFrame::SimpleString(s)) if s.eq_ignore_ascii_case("ok") => {
                    return Ok(());
                }
                Ok(RespFrame::Error(e)) if e.starts_with("READONLY") => {
                    debug!(
                        "Write attempt {} hit a read-only instance; re-discovering master.",
                        attempt
                    );
                    self.drop_master().await;
                    let _ = self.rediscover().await;
                }
                Ok(RespFrame::Error(e)) => {
                    return Err(JasperError::InvalidRequest(e));
                }
                Ok(other) => {
                    return Err(JasperError::Internal(format!(
                        "unexpected SET reply: {other:?}"
                    )));
                }
                Err(e) => {
                    debug!("Write attempt {} failed: {}; re-discovering master.", attempt, e);
                    self.drop_master().await;
                    let _ = self.rediscover().await;
                }
            }
        }

        Err(JasperError::MaxRetriesExceeded(format!(
            "SET {key} failed after {MAX_WRITE_RETRIES} attempts"
        )))
    }

    /// Reads a key from a replica chosen round-robin, falling back to the
    /// master when no replica answers.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>, JasperError> {
        let args = [Bytes::from_static(b"GET"), Bytes::from(key.to_string())];

        if let Some(reply) = self.try_replica_read(&args).await {
            return parse_get_reply(reply);
        }

        if self.config.require_strong_consistency {
            self.verify_master_role().await?;
        }
        let reply = self.request_master(&args).await?;
        parse_get_reply(reply)
    }

    /// The master address currently in use, if connected.
    pub async fn current_master_addr(&self) -> Option<String> {
        self.master.lock().await.as_ref().map(|c| c.addr.clone())
    }

    async fn request_master(&self, args: &[Bytes]) -> Result<RespFrame, JasperError> {
        let mut master = self.master.lock().await;
        if master.is_none() {
            let (host, port) = self.discover_master().await?;
            *master = Some(ServerConnection::connect(format!("{host}:{port}")).await?);
        }
        let conn = master.as_mut().ok_or_else(|| {
            JasperError::Internal("master connection unexpectedly missing".into())
        })?;
        let result = conn.request(args).await;
        if result.is_err() {
            *master = None;
        }
        result
    }

    async fn drop_master(&self) {
        *self.master.lock().await = None;
    }

    /// Attempts one replica read, rotating through the pool. Dead replicas
    /// are dropped from the pool as they fail.
    async fn try_replica_read(&self, args: &[Bytes]) -> Option<RespFrame> {
        if self.config.require_strong_consistency {
            // Strong consistency always reads from the verified master.
            return None;
        }
        let mut replicas = self.replicas.lock().await;
        while !replicas.is_empty() {
            let index = self.round_robin.fetch_add(1, Ordering::Relaxed) % replicas.len();
            match replicas[index].request(args).await {
                Ok(reply) => return Some(reply),
                Err(e) => {
                    let addr = replicas[index].addr.clone();
                    debug!("Replica {} failed a read: {}; dropping it.", addr, e);
                    replicas.remove(index);
                }
            }
        }
        None
    }

    /// Queries the sentinels sequentially until one reports the master.
    async fn discover_master(&self) -> Result<(String, u16), JasperError> {
        for sentinel_addr in &self.config.sentinel_addrs {
            let mut sentinel = match SentinelClient::connect(sentinel_addr).await {
                Ok(client) => client,
                Err(e) => {
                    debug!("Cannot reach sentinel {}: {}", sentinel_addr, e);
                    continue;
                }
            };
            match sentinel
                .get_master_addr_by_name(&self.config.master_name)
                .await
            {
                Ok(Some(addr)) => return Ok(addr),
                Ok(None) => {
                    debug!(
                        "Sentinel {} does not know master '{}'",
                        sentinel_addr, self.config.master_name
                    );
                }
                Err(e) => {
                    debug!(
                        "GET-MASTER-ADDR-BY-NAME failed against {}: {}",
                        sentinel_addr, e
                    );
                }
            }
        }
        Err(JasperError::SentinelError(
            "no sentinel could name the current master".into(),
        ))
    }

    /// Queries the sentinels for the replica set of the monitored master.
    async fn discover_replicas(&self) -> Vec<(String, u16)> {
        for sentinel_addr in &self.config.sentinel_addrs {
            let Ok(mut sentinel) = SentinelClient::connect(sentinel_addr).await else {
                continue;
            };
            let request = RespFrame::command([
                Bytes::from_static(b"SENTINEL"),
                Bytes::from_static(b"REPLICAS"),
                Bytes::from(self.config.master_name.clone()),
            ]);
            match sentinel
                .send_and_receive(request, Duration::from_secs(2))
                .await
            {
                Ok(reply) => return parse_replicas_reply(&reply),
                Err(e) => debug!("SENTINEL REPLICAS failed against {}: {}", sentinel_addr, e),
            }
        }
        Vec::new()
    }

    /// Re-runs discovery and swaps connections to the (possibly new) master
    /// and replica set.
    pub async fn rediscover(&self) -> Result<(), JasperError> {
        let (host, port) = self.discover_master().await?;
        let addr = format!("{host}:{port}");

        {
            let mut master = self.master.lock().await;
            let needs_reconnect = master.as_ref().map(|c| c.addr != addr).unwrap_or(true);
            if needs_reconnect {
                info!("Connecting to master {} for '{}'", addr, self.config.master_name);
                *master = Some(ServerConnection::connect(addr.clone()).await?);
            }
        }

        let mut pool = Vec::new();
        for (replica_host, replica_port) in self.discover_replicas().await {
            let replica_addr = format!("{replica_host}:{replica_port}");
            if replica_addr == addr {
                continue;
            }
            match ServerConnection::connect(replica_addr.clone()).await {
                Ok(conn) => pool.push(conn),
                Err(e) => debug!("Cannot connect to replica {}: {}", replica_addr, e),
            }
        }
        *self.replicas.lock().await = pool;
        Ok(())
    }

    /// Pre-verifies the master role via `INFO replication`.
    async fn verify_master_role(&self) -> Result<(), JasperError> {
        let args = [Bytes::from_static(b"INFO"), Bytes::from_static(b"replication")];
        let reply = self.request_master(&args).await?;
        let RespFrame::BulkString(info) = reply else {
            return Err(JasperError::Internal("unexpected INFO reply".into()));
        };
        let text = String::from_utf8_lossy(&info);
        if text.lines().any(|line| line.trim() == "role:master") {
            Ok(())
        } else {
            self.drop_master().await;
            Err(JasperError::ReplicationError(
                "connected instance is not a master".into(),
            ))
        }
    }
}

/// Periodically re-queries the sentinels; a reported master that differs
/// from the current connection triggers a reconnect.
async fn health_check_loop(client: Weak<SentinelAwareClient>, interval: Duration) {
    let mut tick = tokio::time::interval(interval);
    tick.tick().await;
    loop {
        tick.tick().await;
        let Some(client) = client.upgrade() else {
            return;
        };
        let current = client.current_master_addr().await;
        match client.discover_master().await {
            Ok((host, port)) => {
                let reported = format!("{host}:{port}");
                if current.as_deref() != Some(reported.as_str()) {
                    info!(
                        "Sentinel reports master moved to {}; reconnecting.",
                        reported
                    );
                    client.drop_master().await;
                    if let Err(e) = client.rediscover().await {
                        warn!("Re-discovery after master change failed: {}", e);
                    }
                }
            }
            Err(e) => debug!("Health check discovery failed: {}", e),
        }
    }
}

fn parse_get_reply(reply: RespFrame) -> Result<Option<Bytes>, JasperError> {
    match reply {
        RespFrame::BulkString(b) => Ok(Some(b)),
        RespFrame::Null => Ok(None),
        RespFrame::Error(e) => Err(JasperError::InvalidRequest(e)),
        other => Err(JasperError::Internal(format!(
            "unexpected GET reply: {other:?}"
        ))),
    }
}

/// Parses the nested-array reply of `SENTINEL REPLICAS <name>`: one flat
/// field/value array per replica, from which `ip` and `port` are extracted.
pub fn parse_replicas_reply(reply: &RespFrame) -> Vec<(String, u16)> {
    let RespFrame::Array(entries) = reply else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for entry in entries {
        let RespFrame::Array(fields) = entry else {
            continue;
        };
        let mut ip = None;
        let mut port = None;
        let mut iter = fields.iter();
        while let (Some(name), Some(value)) = (iter.next(), iter.next()) {
            let name = match name {
                RespFrame::BulkString(b) => String::from_utf8_lossy(b).to_string(),
                RespFrame::SimpleString(s) => s.clone(),
                _ => continue,
            };
            match name.as_str() {
                "ip" => {
                    if let RespFrame::BulkString(b) = value {
                        ip = Some(String::from_utf8_lossy(b).to_string());
                    }
                }
                "port" => {
                    port = match value {
                        RespFrame::Integer(p) => Some(*p as u16),
                        RespFrame::BulkString(b) => String::from_utf8_lossy(b).parse().ok(),
                        _ => None,
                    };
                }
                _ => {}
            }
        }
        if let (Some(ip), Some(port)) = (ip, port) {
            out.push((ip, port));
        }
    }
    out
}
