use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::events::ClientEvent;
use crate::preload::PreloadQueue;
use crate::token::TokenStore;
use crate::upload::{self, AssetApi, HttpAssetApi, Uploaded};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::{
    get_timestamp, read_packet, write_packet, Blueprint, ChatMessage, Entity, EntityPatch,
    KickReason, LiveKitGrant, Packet, Snapshot, UserId, World,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

const DISCONNECTED_MESSAGE: &str = "You have been disconnected.";

/// What the transport tasks hand to the session.
#[derive(Debug)]
pub enum Incoming {
    Packet(Packet),
    Closed(Option<u16>),
}

/// One client's view of the world and its connection to the server.
///
/// Frames are decoded as they arrive and queued; [`ClientNetwork::flush`]
/// applies everything queued so far, in order, once per tick.
pub struct ClientNetwork {
    config: ClientConfig,
    pub world: World,
    id: Option<UserId>,
    /// Server clock minus local clock, in seconds.
    server_time_offset: f64,
    assets_url: String,
    api_url: Option<String>,
    max_upload_size: u64,
    has_admin_code: bool,
    livekit: Option<LiveKitGrant>,
    preloader: PreloadQueue,
    tokens: TokenStore,
    api: Option<Arc<dyn AssetApi>>,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    queue_tx: mpsc::UnboundedSender<Incoming>,
    queue_rx: mpsc::UnboundedReceiver<Incoming>,
    events: mpsc::UnboundedSender<ClientEvent>,
    muted: HashSet<UserId>,
    levels: HashMap<UserId, f32>,
    kicked: Option<KickReason>,
    closed: bool,
}

impl ClientNetwork {
    pub fn new(
        config: ClientConfig,
        tokens: TokenStore,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let network = Self {
            api_url: config.api_url.clone(),
            config,
            world: World::new(),
            id: None,
            server_time_offset: 0.0,
            assets_url: String::new(),
            max_upload_size: 0,
            has_admin_code: false,
            livekit: None,
            preloader: PreloadQueue::default(),
            tokens,
            api: None,
            outbound: None,
            queue_tx,
            queue_rx,
            events,
            muted: HashSet::new(),
            levels: HashMap::new(),
            kicked: None,
            closed: false,
        };
        (network, events_rx)
    }

    /// Uses `api` for uploads instead of the HTTP API the server announces.
    pub fn with_asset_api(mut self, api: Arc<dyn AssetApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn id(&self) -> Option<&UserId> {
        self.id.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.outbound.is_some() && !self.closed
    }

    pub fn assets_url(&self) -> &str {
        &self.assets_url
    }

    pub fn has_admin_code(&self) -> bool {
        self.has_admin_code
    }

    pub fn livekit(&self) -> Option<&LiveKitGrant> {
        self.livekit.as_ref()
    }

    pub fn kicked(&self) -> Option<&KickReason> {
        self.kicked.as_ref()
    }

    pub fn is_muted(&self, player: &UserId) -> bool {
        self.muted.contains(player)
    }

    pub fn level(&self, player: &UserId) -> f32 {
        self.levels.get(player).copied().unwrap_or(0.0)
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.tokens.get()
    }

    pub fn preloader(&mut self) -> &mut PreloadQueue {
        &mut self.preloader
    }

    /// Connection URL with the persisted token and the name/avatar hints.
    pub fn connect_url(&self) -> Result<String, ClientError> {
        let mut params = Vec::new();
        if let Some(token) = self.tokens.get() {
            params.push(("authToken", token));
        }
        if let Some(name) = &self.config.name {
            params.push(("name", name.as_str()));
        }
        if let Some(avatar) = &self.config.avatar {
            params.push(("avatar", avatar.as_str()));
        }
        let mut url =
            reqwest::Url::parse(&self.config.server_url).map_err(|e| ClientError::InvalidUrl {
                url: self.config.server_url.clone(),
                reason: e.to_string(),
            })?;
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        Ok(url.into())
    }

    /// Opens the WebSocket and starts the reader and writer tasks.
    pub async fn init(&mut self) -> Result<(), ClientError> {
        let url = self.connect_url()?;
        info!("Connecting to {}", self.config.server_url);
        let (stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut sink, mut source) = stream.split();

        let (mut outbound_rx, queue) = self.attach();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = sink.send(Message::Binary(frame.into())).await {
                    debug!("Write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            let mut code = None;
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Binary(data)) => match read_packet(&data) {
                        Ok(packet) => {
                            if queue.send(Incoming::Packet(packet)).is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!("Dropping frame: {}", e),
                    },
                    Ok(Message::Close(frame)) => {
                        code = frame.map(|frame| u16::from(frame.code));
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Connection error: {}", e);
                        break;
                    }
                }
            }
            let _ = queue.send(Incoming::Closed(code));
        });

        Ok(())
    }

    /// Wires the session to a transport: returns the encoded frames it sends
    /// and a sender for what the transport receives.
    pub fn attach(
        &mut self,
    ) -> (
        mpsc::UnboundedReceiver<Vec<u8>>,
        mpsc::UnboundedSender<Incoming>,
    ) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        self.outbound = Some(outbound);
        self.closed = false;
        (outbound_rx, self.queue_tx.clone())
    }

    /// Encodes and writes `packet` immediately.
    pub fn send(&self, packet: &Packet) -> Result<(), ClientError> {
        let outbound = self
            .outbound
            .as_ref()
            .filter(|_| !self.closed)
            .ok_or(ClientError::NotConnected)?;
        let frame = write_packet(packet)?;
        outbound
            .send(frame)
            .map_err(|_| ClientError::NotConnected)
    }

    /// Sends a timestamped ping; the server echoes it back as `pong`.
    pub fn ping(&self) -> Result<(), ClientError> {
        self.send(&Packet::Ping(get_timestamp()))
    }

    /// Sends a chat line, or a command when it starts with `/`.
    pub fn chat(&mut self, line: &str) -> Result<(), ClientError> {
        if let Some(words) = shared::parse_command(line) {
            return self.send(&Packet::Command(words));
        }
        let player = self
            .id
            .as_ref()
            .and_then(|id| self.world.player(id))
            .ok_or(ClientError::NotConnected)?;
        let message = ChatMessage::new(player, line);
        self.world.add_chat(message.clone());
        self.send(&Packet::ChatAdded(message))
    }

    pub fn enqueue(&self, packet: Packet) {
        let _ = self.queue_tx.send(Incoming::Packet(packet));
    }

    /// Applies everything received since the last flush.
    pub async fn flush(&mut self) {
        while let Ok(incoming) = self.queue_rx.try_recv() {
            match incoming {
                Incoming::Packet(packet) => {
                    debug!("Applying {}", packet.name());
                    self.on_packet(packet).await;
                }
                Incoming::Closed(code) => self.on_close(code),
            }
        }
    }

    async fn on_packet(&mut self, packet: Packet) {
        match packet {
            Packet::Snapshot(snapshot) => self.on_snapshot(*snapshot).await,
            Packet::Kick(reason) => self.on_kick(reason),
            Packet::ChatAdded(message) => {
                self.world.add_chat(message.clone());
                self.emit(ClientEvent::Chat(message));
            }
            Packet::ChatCleared => self.world.clear_chat(),
            Packet::BlueprintAdded(blueprint) => {
                if blueprint.preload {
                    self.preload_blueprint(&blueprint);
                }
                if let Err(e) = self.world.add_blueprint(blueprint) {
                    warn!("{}", e);
                }
            }
            Packet::BlueprintModified(patch) => {
                if let Err(e) = self.world.modify_blueprint(&patch) {
                    warn!("{}", e);
                }
            }
            Packet::EntityAdded(entity) => {
                if let Err(e) = self.world.add_entity(entity) {
                    warn!("{}", e);
                }
            }
            Packet::EntityModified(patch) => {
                if let Err(e) = self.world.modify_entity(&patch) {
                    debug!("{}", e);
                }
            }
            Packet::EntityRemoved(id) => {
                if self.world.remove_entity(&id).is_none() {
                    debug!("Entity {} already gone", id);
                }
            }
            Packet::EntityEvent(event) => self.emit(ClientEvent::EntityEvent(event)),
            Packet::SettingsModified(change) => self.world.settings.apply(&change),
            Packet::PlayerTeleport {
                position,
                rotation_y,
            } => {
                if let Some(id) = self.local_entity() {
                    let mut patch = EntityPatch::new(id);
                    patch.position = Some(position);
                    let _ = self.world.modify_entity(&patch);
                }
                self.emit(ClientEvent::Teleport {
                    position,
                    rotation_y,
                });
            }
            Packet::PlayerPush { force } => self.emit(ClientEvent::Push { force }),
            Packet::PlayerSessionAvatar { avatar } => {
                if let Some(url) = &avatar {
                    self.preloader.push(url);
                }
                if let Some(id) = self.local_entity() {
                    let mut patch = EntityPatch::new(id);
                    patch.session_avatar = Some(avatar);
                    let _ = self.world.modify_entity(&patch);
                }
            }
            Packet::Mute { player_id, muted } => {
                if muted {
                    self.muted.insert(player_id.clone());
                } else {
                    self.muted.remove(&player_id);
                }
                self.emit(ClientEvent::Muted { player_id, muted });
            }
            Packet::LiveKitLevel { player_id, level } => {
                self.levels.insert(player_id, level);
            }
            Packet::Pong(sent) => {
                let rtt = get_timestamp().saturating_sub(sent);
                self.emit(ClientEvent::Pong { rtt });
            }
            other => warn!("Unexpected {} from server", other.name()),
        }
    }

    async fn on_snapshot(&mut self, snapshot: Snapshot) {
        self.server_time_offset = snapshot.server_time as f64 / 1000.0 - local_time();
        self.id = Some(snapshot.id.clone());
        self.assets_url = snapshot.assets_url;
        self.max_upload_size = snapshot.max_upload_size;
        self.has_admin_code = snapshot.has_admin_code;
        self.livekit = snapshot.livekit;
        if self.api_url.is_none() {
            self.api_url = Some(snapshot.api_url);
        }

        self.preloader.set_assets_url(self.assets_url.clone());
        for blueprint in snapshot.blueprints.iter().filter(|b| b.preload) {
            self.preload_blueprint(blueprint);
        }
        let local_avatar = snapshot
            .entities
            .iter()
            .filter_map(Entity::as_player)
            .find(|player| player.user_id == snapshot.id)
            .and_then(|player| player.session_avatar.clone().or(player.avatar.clone()))
            .or(snapshot.settings.avatar.clone());
        if let Some(avatar) = local_avatar {
            self.preloader.push(&avatar);
        }

        self.world.collections = snapshot.collections;
        self.world.settings = snapshot.settings;
        self.world.set_chat(snapshot.chat);
        self.world.set_blueprints(snapshot.blueprints);
        self.world.set_entities(snapshot.entities);

        if let Err(e) = self.tokens.set(snapshot.auth_token).await {
            error!("Failed to persist auth token: {}", e);
        }

        info!(
            "Joined as {} with {} entities",
            snapshot.id,
            self.world.entity_count()
        );
        self.emit(ClientEvent::Ready { id: snapshot.id });
    }

    fn on_kick(&mut self, reason: KickReason) {
        warn!("Kicked: {}", reason.code());
        self.world.add_chat(ChatMessage::system(reason.message()));
        self.kicked = Some(reason.clone());
        self.emit(ClientEvent::Kicked(reason));
        // Dropping the sender ends the writer task, which closes the socket.
        self.outbound = None;
    }

    /// Handles the transport going away. No reconnect is attempted.
    pub fn on_close(&mut self, code: Option<u16>) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.outbound = None;
        info!("Connection closed ({:?})", code);
        if self.kicked.is_none() {
            self.world.add_chat(ChatMessage::system(DISCONNECTED_MESSAGE));
        }
        self.emit(ClientEvent::Disconnected { code });
    }

    /// Server clock in seconds.
    pub fn network_time(&self) -> f64 {
        local_time() + self.server_time_offset
    }

    /// Uploads `bytes` unless the server already has them.
    pub async fn upload(&mut self, bytes: Vec<u8>, ext: &str) -> Result<Uploaded, ClientError> {
        let api = match &self.api {
            Some(api) => api.clone(),
            None => {
                let base = self.api_url.clone().ok_or(ClientError::NotConnected)?;
                let api: Arc<dyn AssetApi> = Arc::new(HttpAssetApi::new(base));
                self.api = Some(api.clone());
                api
            }
        };
        let max = if self.max_upload_size > 0 {
            self.max_upload_size
        } else {
            u64::MAX
        };
        upload::upload(api.as_ref(), bytes, ext, max).await
    }

    fn preload_blueprint(&mut self, blueprint: &Blueprint) {
        if let Some(model) = &blueprint.model {
            self.preloader.push(model);
        }
        if let Some(script) = &blueprint.script {
            self.preloader.push(script);
        }
        // File props look like `{ "type": "...", "url": "asset://..." }`.
        if let Some(props) = blueprint.props.0.as_object() {
            for value in props.values() {
                if let Some(url) = value.get("url").and_then(|url| url.as_str()) {
                    self.preloader.push(url);
                }
            }
        }
    }

    fn local_entity(&self) -> Option<shared::EntityId> {
        self.id.as_ref().map(shared::EntityId::from)
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

/// Local wall clock in seconds since the unix epoch.
fn local_time() -> f64 {
    get_timestamp() as f64 / 1000.0
}
