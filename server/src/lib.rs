//! # World Server Library
//!
//! Authoritative host for a shared world of players and placeable apps. The
//! server owns the canonical world state, applies client mutations after
//! checking the sender's rank, and relays every accepted change to the other
//! connections.
//!
//! ## Architecture
//!
//! ### One queue, one loop
//! Every WebSocket gets a small pump task ([`socket::serve`]) that decodes
//! frames and pushes them onto a single queue. The registry
//! ([`network::ServerNetwork`]) drains that queue once per tick and runs each
//! handler to completion, so handlers for different connections never
//! interleave and cross-connection ordering is plain arrival order. The
//! liveness probe and the persistence sweep run on the same loop.
//!
//! ### Handshake
//! A connection is checked against the player limit, resolved to a user
//! through its auth token (or given a fresh anonymous user), refused if that
//! user is already connected, and only then gets a player entity and a full
//! [`shared::Snapshot`].
//!
//! ### Authority
//! Builder and admin operations check the sender's rank. Rejections are
//! logged and dropped; a stale blueprint edit gets the stored blueprint sent
//! back so the client can revert.
//!
//! ### Persistence
//! Handlers mark changed blueprints and apps dirty. A periodic sweep writes
//! them through the [`storage::Storage`] trait, skipping apps someone is still
//! moving or uploading and retrying failed writes on the next sweep.
//!
//! ## Modules
//!
//! - [`network`]: session registry, handlers, sweeps and the main loop
//! - [`socket`]: per-connection wrapper and the WebSocket pump
//! - [`persistence`]: dirty tracking and the save sweep
//! - [`storage`] / [`file_storage`]: storage trait, in-memory and JSON-file backends
//! - [`auth`]: auth token issuing and verification
//! - [`commands`]: slash commands
//! - [`assets`] / [`http`]: content-addressed uploads and the HTTP routes
//! - [`config`]: command line and environment configuration
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::file_storage::FileStorage;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let storage = Arc::new(FileStorage::open(&config.world_dir).await?);
//!
//!     let server = server::start(config, storage).await?;
//!     println!("listening on {}", server.addr);
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod assets;
pub mod auth;
pub mod commands;
pub mod config;
pub mod error;
pub mod file_storage;
pub mod http;
pub mod network;
pub mod persistence;
pub mod socket;
pub mod storage;

use assets::AssetStore;
use config::ServerConfig;
use error::ServerError;
use log::{error, info};
use network::ServerNetwork;
use std::net::SocketAddr;
use std::sync::Arc;
use storage::Storage;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A running server.
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    network: JoinHandle<()>,
    http: JoinHandle<()>,
}

impl ServerHandle {
    /// Stops accepting connections, disconnects everyone and runs a final save.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.network.await {
            error!("Network loop panicked: {}", e);
        }
        self.http.abort();
        info!("Server stopped");
    }
}

/// Loads the world, binds the listener and spawns the network loop and the
/// HTTP server.
///
/// Port 0 binds an ephemeral port; the public URLs announced to clients then
/// follow the port actually bound.
pub async fn start(
    mut config: ServerConfig,
    storage: Arc<dyn Storage>,
) -> Result<ServerHandle, ServerError> {
    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let addr = listener.local_addr()?;
    config.port = addr.port();

    let assets = AssetStore::open(config.assets_dir(), config.max_upload_size).await?;

    let mut network = ServerNetwork::new(config, storage);
    network.load().await?;

    let app = http::router(http::AppState {
        network: network.handle(),
        assets: Arc::new(assets),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut http_shutdown = shutdown_rx.clone();
    let http = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.changed().await;
            })
            .await;
        if let Err(e) = result {
            error!("HTTP server failed: {}", e);
        }
    });

    let network = tokio::spawn(network.run(shutdown_rx));
    info!("Server listening on {}", addr);

    Ok(ServerHandle {
        addr,
        shutdown: shutdown_tx,
        network,
        http,
    })
}
