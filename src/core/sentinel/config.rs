// src/core/sentinel/config.rs

//! Sentinel process configuration, built from command-line flags.

use anyhow::{Result, anyhow, bail};
use std::time::Duration;

/// Configuration for a sentinel process monitoring one master.
#[derive(Debug, Clone)]
pub struct SentinelConfig {
    /// The address the peer server binds and announces.
    pub host: String,
    pub port: u16,
    pub master_name: String,
    pub master_host: String,
    pub master_port: u16,
    /// Minimum agreeing sentinels (including the candidate) to win an
    /// election and proceed with failover.
    pub quorum: usize,
    /// How long an instance must be unreachable before it is subjectively down.
    pub down_after: Duration,
    /// Minimum interval between completed failovers for the same master.
    pub failover_timeout: Duration,
    /// Peer sentinel addresses, `host:port`.
    pub sentinel_addrs: Vec<String>,
    pub max_connections: usize,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 26379,
            master_name: String::new(),
            master_host: "127.0.0.1".to_string(),
            master_port: 6379,
            quorum: 2,
            down_after: Duration::from_millis(30_000),
            failover_timeout: Duration::from_millis(180_000),
            sentinel_addrs: Vec::new(),
            max_connections: 10_000,
        }
    }
}

impl SentinelConfig {
    /// Parses the sentinel CLI flags. `args` excludes the binary name and the
    /// `--sentinel` mode flag itself.
    pub fn from_cli_args(args: &[String]) -> Result<Self> {
        let mut config = SentinelConfig::default();

        let mut i = 0;
        while i < args.len() {
            let flag = args[i].as_str();
            let value = args
                .get(i + 1)
                .ok_or_else(|| anyhow!("flag {flag} requires a value"))?;
            match flag {
                "--port" => config.port = value.parse()?,
                "--host" => config.host = value.clone(),
                "--master-name" => config.master_name = value.clone(),
                "--master-host" => config.master_host = value.clone(),
                "--master-port" => config.master_port = value.parse()?,
                "--quorum" => config.quorum = value.parse()?,
                "--down-after-ms" => {
                    config.down_after = Duration::from_millis(value.parse()?);
                }
                "--failover-timeout-ms" => {
                    config.failover_timeout = Duration::from_millis(value.parse()?);
                }
                "--sentinel-addrs" => {
                    config.sentinel_addrs = value
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect();
                }
                other => bail!("unknown sentinel flag: {other}"),
            }
            i += 2;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.master_name.is_empty() {
            bail!("--master-name must not be empty");
        }
        if self.quorum == 0 {
            bail!("--quorum must be at least 1");
        }
        if self.down_after.is_zero() {
            bail!("--down-after-ms must be positive");
        }
        Ok(())
    }

    /// The `host:port` identity this sentinel announces to its peers.
    pub fn my_id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
