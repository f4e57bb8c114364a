// src/main.rs

//! The main entry point for the JasperDB binary: either the data server or,
//! with `--sentinel`, the high-availability coordinator.

use anyhow::Result;
use jasperdb::config::Config;
use jasperdb::sentinel::SentinelConfig;
use jasperdb::{sentinel, server};
use std::env;
use tracing::{error, info};
use tracing_subscriber::filter::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("JasperDB version {VERSION}");
        return Ok(());
    }

    // Check if the --sentinel flag is present to start in sentinel mode.
    if args.len() > 1 && args[1] == "--sentinel" {
        // --- Sentinel Mode ---

        // Default to a more verbose level for the sentinel modules.
        let log_level = env::var("RUST_LOG")
            .unwrap_or_else(|_| "info,jasperdb::core::sentinel=debug".to_string());
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(log_level))
            .compact()
            .with_ansi(true)
            .init();

        let config = match SentinelConfig::from_cli_args(&args[2..]) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Invalid sentinel configuration: {e}");
                std::process::exit(1);
            }
        };

        info!("Starting JasperDB in sentinel mode...");
        if let Err(e) = sentinel::run(config, None).await {
            error!("Sentinel runtime error: {}", e);
            return Err(e);
        }
    } else {
        // --- Data Server Mode ---

        // The config path can be provided via --config; otherwise the default
        // file is used when present, and built-in defaults when it is not.
        let config_path = args
            .iter()
            .position(|arg| arg == "--config")
            .and_then(|i| args.get(i + 1))
            .map(|s| s.as_str());

        let mut config = match config_path {
            Some(path) => match Config::from_file(path) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Failed to load configuration from \"{path}\": {e}");
                    std::process::exit(1);
                }
            },
            None => Config::from_file("config.toml").unwrap_or_default(),
        };

        // Override the port if provided as a command-line argument.
        if let Some(port_index) = args.iter().position(|arg| arg == "--port") {
            match args.get(port_index + 1).map(|s| s.parse::<u16>()) {
                Some(Ok(port)) => config.port = port,
                _ => {
                    eprintln!("--port flag requires a valid port number");
                    std::process::exit(1);
                }
            }
        }

        let log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(log_level))
            .compact()
            .with_ansi(true)
            .init();

        if let Err(e) = server::run(config).await {
            error!("Server runtime error: {}", e);
            return Err(e);
        }
    }

    Ok(())
}
