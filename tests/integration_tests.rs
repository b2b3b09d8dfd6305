//! Integration tests for the server and client crates
//!
//! These tests run a real server on a loopback port and drive it with real
//! client sessions over WebSocket and HTTP.

use client::upload::{AssetApi, HttpAssetApi};
use client::{ClientConfig, ClientEvent, ClientNetwork, TokenStore};
use server::config::ServerConfig;
use server::storage::{MemoryStorage, Storage};
use server::ServerHandle;
use shared::{Entity, KickReason, Packet, UserId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, Instant};

const WAIT: Duration = Duration::from_secs(5);

async fn start_server(dir: &tempfile::TempDir, storage: Arc<MemoryStorage>) -> ServerHandle {
    let config = ServerConfig {
        port: 0,
        world_dir: dir.path().join("world"),
        save_interval: Duration::ZERO,
        ..Default::default()
    };
    server::start(config, storage).await.unwrap()
}

struct TestClient {
    network: ClientNetwork,
    events: UnboundedReceiver<ClientEvent>,
    seen: Vec<ClientEvent>,
}

impl TestClient {
    async fn connect(server: &ServerHandle, token: Option<&str>, name: Option<&str>) -> Self {
        let config = ClientConfig {
            server_url: format!("ws://{}/ws", server.addr),
            name: name.map(str::to_string),
            ..Default::default()
        };
        let mut tokens = TokenStore::memory();
        if let Some(token) = token {
            tokens.set(token.to_string()).await.unwrap();
        }
        let (mut network, events) = ClientNetwork::new(config, tokens);
        network.init().await.unwrap();
        Self {
            network,
            events,
            seen: Vec::new(),
        }
    }

    /// Ticks the client until an event matches or the wait runs out.
    async fn wait_for(&mut self, predicate: impl Fn(&ClientEvent) -> bool) -> ClientEvent {
        let deadline = Instant::now() + WAIT;
        loop {
            self.network.flush().await;
            while let Ok(event) = self.events.try_recv() {
                self.seen.push(event.clone());
                if predicate(&event) {
                    return event;
                }
            }
            assert!(Instant::now() < deadline, "timed out, saw {:?}", self.seen);
            sleep(Duration::from_millis(10)).await;
        }
    }

    async fn ready(&mut self) -> UserId {
        match self
            .wait_for(|event| matches!(event, ClientEvent::Ready { .. }))
            .await
        {
            ClientEvent::Ready { id } => id,
            _ => unreachable!(),
        }
    }

    async fn ticks(&mut self, count: usize) {
        for _ in 0..count {
            sleep(Duration::from_millis(20)).await;
            self.network.flush().await;
        }
    }
}

/// HANDSHAKE TESTS
mod handshake_tests {
    use super::*;

    /// An anonymous client gets a snapshot with exactly one player entity
    #[tokio::test]
    async fn anonymous_client_receives_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(&dir, Arc::new(MemoryStorage::new())).await;

        let mut client = TestClient::connect(&server, None, Some("Ada")).await;
        let id = client.ready().await;

        let players: Vec<_> = client
            .network
            .world
            .entities()
            .into_iter()
            .filter(Entity::is_player)
            .collect();
        assert_eq!(players.len(), 1);
        let me = client.network.world.player(&id).unwrap();
        assert_eq!(me.name, "Ada");
        assert!(client.network.auth_token().is_some());
        assert!(client
            .network
            .world
            .blueprint(&shared::BlueprintId::from("$scene"))
            .is_some());

        server.shutdown().await;
    }

    /// A second connection for the same user is kicked and the first keeps working
    #[tokio::test]
    async fn duplicate_user_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(&dir, Arc::new(MemoryStorage::new())).await;

        let mut first = TestClient::connect(&server, None, None).await;
        let id = first.ready().await;
        let token = first.network.auth_token().unwrap().to_string();

        let mut second = TestClient::connect(&server, Some(&token), None).await;
        second
            .wait_for(|event| matches!(event, ClientEvent::Disconnected { .. }))
            .await;
        assert!(second
            .seen
            .contains(&ClientEvent::Kicked(KickReason::DuplicateUser)));
        assert!(!second
            .seen
            .iter()
            .any(|event| matches!(event, ClientEvent::Ready { .. })));

        first.network.send(&Packet::Ping(shared::get_timestamp())).unwrap();
        first
            .wait_for(|event| matches!(event, ClientEvent::Pong { .. }))
            .await;
        assert_eq!(first.network.id(), Some(&id));
        assert!(first.network.is_connected());

        server.shutdown().await;
    }

    /// Reconnecting with a saved token restores the same user
    #[tokio::test]
    async fn token_restores_identity() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(MemoryStorage::new());
        let server = start_server(&dir, storage.clone()).await;

        let mut first = TestClient::connect(&server, None, Some("Grace")).await;
        let id = first.ready().await;
        let token = first.network.auth_token().unwrap().to_string();
        drop(first);

        // Let the server notice the first connection is gone.
        let mut second = loop {
            let mut candidate = TestClient::connect(&server, Some(&token), None).await;
            let event = candidate
                .wait_for(|event| {
                    matches!(
                        event,
                        ClientEvent::Ready { .. } | ClientEvent::Disconnected { .. }
                    )
                })
                .await;
            if matches!(event, ClientEvent::Ready { .. }) {
                break candidate;
            }
            sleep(Duration::from_millis(50)).await;
        };

        assert_eq!(second.network.id(), Some(&id));
        let me = second.network.world.player(&id).unwrap();
        assert_eq!(me.name, "Grace");
        second.ticks(1).await;

        // user records reach storage with the final save
        server.shutdown().await;
        let user = storage.user(&id).await.unwrap().unwrap();
        assert_eq!(user.name, "Grace");
    }
}

/// REPLICATION TESTS
mod replication_tests {
    use super::*;

    /// Chat from one client reaches the other
    #[tokio::test]
    async fn chat_is_relayed() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(&dir, Arc::new(MemoryStorage::new())).await;

        let mut alice = TestClient::connect(&server, None, Some("Alice")).await;
        alice.ready().await;
        let mut bob = TestClient::connect(&server, None, Some("Bob")).await;
        bob.ready().await;

        alice.network.chat("hello bob").unwrap();
        let event = bob
            .wait_for(|event| matches!(event, ClientEvent::Chat(_)))
            .await;
        match event {
            ClientEvent::Chat(message) => {
                assert_eq!(message.body, "hello bob");
                assert_eq!(message.from.as_deref(), Some("Alice"));
            }
            _ => unreachable!(),
        }

        server.shutdown().await;
    }

    /// Players joining and leaving show up in the other client's world
    #[tokio::test]
    async fn players_come_and_go() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(&dir, Arc::new(MemoryStorage::new())).await;

        let mut alice = TestClient::connect(&server, None, None).await;
        alice.ready().await;
        let mut bob = TestClient::connect(&server, None, None).await;
        let bob_id = bob.ready().await;

        let deadline = Instant::now() + WAIT;
        while alice.network.world.player(&bob_id).is_none() {
            assert!(Instant::now() < deadline);
            alice.ticks(1).await;
        }

        drop(bob);
        while alice.network.world.player(&bob_id).is_some() {
            assert!(Instant::now() < deadline);
            alice.ticks(1).await;
        }

        server.shutdown().await;
    }

    /// Shutting down disconnects clients with a going-away code
    #[tokio::test]
    async fn shutdown_disconnects_clients() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(&dir, Arc::new(MemoryStorage::new())).await;

        let mut client = TestClient::connect(&server, None, None).await;
        client.ready().await;
        server.shutdown().await;

        let event = client
            .wait_for(|event| matches!(event, ClientEvent::Disconnected { .. }))
            .await;
        assert_eq!(event, ClientEvent::Disconnected { code: Some(1001) });
        assert!(!client.network.is_connected());
    }
}

/// UPLOAD TESTS
mod upload_tests {
    use super::*;

    /// Uploads are skipped when the server already has the content
    #[tokio::test]
    async fn upload_check_then_put() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(&dir, Arc::new(MemoryStorage::new())).await;
        let api = HttpAssetApi::new(format!("http://{}", server.addr));

        let bytes = b"glTF model bytes".to_vec();
        let filename = client::upload::asset_filename(&bytes, "glb");
        assert!(!api.exists(&filename).await.unwrap());

        let first = client::upload::upload(&api, bytes.clone(), "glb", 1024)
            .await
            .unwrap();
        assert!(first.transferred);
        assert!(api.exists(&filename).await.unwrap());

        let second = client::upload::upload(&api, bytes.clone(), "glb", 1024)
            .await
            .unwrap();
        assert!(!second.transferred);

        let stored = tokio::fs::read(dir.path().join("world/assets").join(&filename))
            .await
            .unwrap();
        assert_eq!(stored, bytes);

        server.shutdown().await;
    }

    /// A connected client uploads through the API the server announced
    #[tokio::test]
    async fn client_uploads_after_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(&dir, Arc::new(MemoryStorage::new())).await;

        let mut client = TestClient::connect(&server, None, None).await;
        client.ready().await;
        let uploaded = client
            .network
            .upload(b"texture".to_vec(), "png")
            .await
            .unwrap();
        assert!(uploaded.transferred);
        assert!(uploaded.url().ends_with(".png"));

        server.shutdown().await;
    }

    /// Content that does not match its name is refused
    #[tokio::test]
    async fn mismatched_hash_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let server = start_server(&dir, Arc::new(MemoryStorage::new())).await;
        let api = HttpAssetApi::new(format!("http://{}", server.addr));

        let filename = client::upload::asset_filename(b"one thing", "glb");
        assert!(api.put(&filename, b"another".to_vec()).await.is_err());
        assert!(!api.exists(&filename).await.unwrap());

        server.shutdown().await;
    }
}
