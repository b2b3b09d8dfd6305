use clap::Parser;
use log::info;
use server::config::{Args, ServerConfig};
use server::file_storage::FileStorage;
use std::sync::Arc;

/// Parses command-line arguments, opens the world database and runs the
/// server until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let config = ServerConfig::from(Args::parse());
    info!(
        "Starting world {} ({} Hz, player limit {:?})",
        config.world_dir.display(),
        config.tick_rate,
        config.player_limit
    );

    let storage = Arc::new(FileStorage::open(&config.world_dir).await?);
    let server = server::start(config, storage).await?;

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down gracefully...");
    server.shutdown().await;

    Ok(())
}
