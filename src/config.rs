// src/config.rs

//! Manages data-server configuration: loading from TOML and validation.
//! Every field carries a default so a partial (or missing) file works.

use crate::core::persistence::aof::AppendFsync;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub max_clients: usize,
    /// Failover priority this server announces as a replica, `[0, 1_000_000]`.
    pub replica_priority: u32,
    pub persistence: PersistenceConfig,
    pub replication: ReplicationConfig,
    pub cluster: ClusterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            log_level: "info".to_string(),
            max_clients: 10_000,
            replica_priority: 100,
            persistence: PersistenceConfig::default(),
            replication: ReplicationConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {path}"))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("cannot parse config file {path}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.replica_priority > 1_000_000 {
            anyhow::bail!("replica_priority must be within [0, 1000000]");
        }
        if self.cluster.enabled {
            self.cluster.parse_own_slots()?;
        }
        Ok(())
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PersistenceConfig {
    pub aof_enabled: bool,
    pub aof_path: String,
    pub appendfsync: AppendFsync,
    pub snapshot_path: String,
    /// How often the periodic snapshot task runs; zero disables it.
    #[serde(with = "humantime_serde")]
    pub snapshot_interval: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            aof_enabled: true,
            aof_path: "jasperdb.aof".to_string(),
            appendfsync: AppendFsync::EverySec,
            snapshot_path: "jasperdb.snap".to_string(),
            snapshot_interval: Duration::from_secs(300),
        }
    }
}

/// The replication role this server boots with. `REPLICAOF` changes it at
/// runtime.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ReplicationConfig {
    #[default]
    Primary,
    Replica {
        primary_host: String,
        primary_port: u16,
    },
}

impl ReplicationConfig {
    pub fn is_replica(&self) -> bool {
        matches!(self, ReplicationConfig::Replica { .. })
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct ClusterConfig {
    pub enabled: bool,
    /// Slot ranges this node serves, e.g. `"0-8191"` or `"0-100,200-300"`.
    pub slots: Option<String>,
    /// Statically configured peer nodes.
    pub nodes: Vec<ClusterNodeConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ClusterNodeConfig {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub slots: String,
}

impl ClusterConfig {
    pub fn parse_own_slots(&self) -> Result<Vec<u16>> {
        match &self.slots {
            Some(spec) => parse_slot_spec(spec),
            None => Ok(Vec::new()),
        }
    }
}

/// Parses `"0-100,200,300-400"` into an explicit slot list.
pub fn parse_slot_spec(spec: &str) -> Result<Vec<u16>> {
    let mut slots = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((start, end)) = part.split_once('-') {
            let start: u16 = start.trim().parse().context("bad slot range start")?;
            let end: u16 = end.trim().parse().context("bad slot range end")?;
            if start > end || end as usize >= crate::core::cluster::NUM_SLOTS {
                anyhow::bail!("invalid slot range {part}");
            }
            slots.extend(start..=end);
        } else {
            let slot: u16 = part.parse().context("bad slot number")?;
            if slot as usize >= crate::core::cluster::NUM_SLOTS {
                anyhow::bail!("slot {slot} out of range");
            }
            slots.push(slot);
        }
    }
    Ok(slots)
}
