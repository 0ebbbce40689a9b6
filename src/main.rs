// src/main.rs

//! The main entry point for the coordinator daemon.

use anyhow::Result;
use bluse_coordinator::config::Config;
use bluse_coordinator::core::supervisor::{self, Supervisor};
use std::env;
use tracing::{error, info};
use tracing_subscriber::filter::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("bluse-coordinator version {VERSION}");
        return Ok(());
    }

    // Determine the configuration path. It can be provided via a --config
    // flag; otherwise it defaults to "config.yml".
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("config.yml");

    let config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e}");
            std::process::exit(1);
        }
    };

    // Log level comes from RUST_LOG when set, the config file otherwise.
    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(true)
        .init();

    // Administrative reset mode: clear persisted machine state and exit.
    if args.contains(&"--reset".to_string()) {
        let cleared = supervisor::reset(&config).await?;
        info!("Reset complete, {cleared} keys cleared.");
        return Ok(());
    }

    // One-shot fleet status summary.
    if args.contains(&"--status".to_string()) {
        print!("{}", supervisor::status(&config).await?);
        return Ok(());
    }

    info!("Starting coordinator v{VERSION} against {}", config.redis_addr());
    let supervisor = Supervisor::start(config).await?;
    if let Err(e) = supervisor.run().await {
        error!("Coordinator runtime error: {e}");
        return Err(e.into());
    }
    Ok(())
}
