// src/main.rs

//! The main entry point for the vigil watcher daemon.

use anyhow::Result;
use std::env;
use tracing::{error, info};
use vigil::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();
    if args.contains(&"--version".to_string()) {
        println!("vigil version {VERSION}");
        return Ok(());
    }

    // The configuration path may be given via --config; it defaults to
    // "vigil.toml" in the working directory.
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("vigil.toml");

    // Watcher modules default to verbose logging; everything else to info.
    let log_level = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info,vigil::watcher=debug".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .compact()
        .with_ansi(true)
        .init();

    let config = match Config::from_file(config_path).await {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e}");
            std::process::exit(1);
        }
    };

    info!("Starting vigil {VERSION}...");
    if let Err(e) = vigil::watcher::run(config).await {
        error!("Watcher runtime error: {e}");
        return Err(e);
    }
    Ok(())
}
