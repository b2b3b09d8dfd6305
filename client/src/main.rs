use clap::Parser;
use client::config::Args;
use client::{ClientConfig, ClientEvent, ClientNetwork, TokenStore};
use log::{debug, error, info};
use std::time::Duration;
use tokio::time::interval;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = ClientConfig::from(&args);

    info!("Starting client...");
    info!("Connecting to: {}", config.server_url);

    let tokens = TokenStore::load(args.token_file.clone()).await?;
    let (mut network, mut events) = ClientNetwork::new(config.clone(), tokens);
    network.init().await?;

    let mut upload = args.upload.clone();
    let mut tick_interval = interval(config.tick_duration());
    let mut ping_interval = interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = tick_interval.tick() => {
                network.flush().await;
                for url in network.preloader().drain() {
                    info!("Preload {}", url);
                }
            },

            _ = ping_interval.tick() => {
                if network.is_connected() {
                    if let Err(e) = network.ping() {
                        error!("Error sending ping: {}", e);
                    }
                }
            },

            Some(event) = events.recv() => match event {
                ClientEvent::Ready { id } => {
                    info!("Ready as {} ({} entities)", id, network.world.entity_count());
                    if let Some(path) = upload.take() {
                        let ext = path
                            .extension()
                            .and_then(|ext| ext.to_str())
                            .unwrap_or("bin")
                            .to_string();
                        let bytes = tokio::fs::read(&path).await?;
                        match network.upload(bytes, &ext).await {
                            Ok(uploaded) => info!(
                                "{} -> {} (transferred: {})",
                                path.display(),
                                uploaded.url(),
                                uploaded.transferred
                            ),
                            Err(e) => error!("Upload failed: {}", e),
                        }
                    }
                }
                ClientEvent::Chat(message) => {
                    info!("[{}] {}", message.from.as_deref().unwrap_or("system"), message.body);
                }
                ClientEvent::Kicked(reason) => info!("{}", reason.message()),
                ClientEvent::Disconnected { code } => {
                    info!("Disconnected ({:?})", code);
                    break;
                }
                ClientEvent::Pong { rtt } => debug!("Ping: {}ms", rtt),
                other => info!("{:?}", other),
            },

            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            },
        }
    }

    Ok(())
}
