//! Server session registry.
//!
//! [`ServerNetwork`] owns the world, every registered [`Socket`] and the dirty
//! sets. Network tasks never touch any of it: they push [`Inbound`] entries
//! onto one queue through a [`NetworkHandle`], and the registry drains that
//! queue once per tick, running each handler to completion in arrival order.
//! Liveness and persistence sweeps run on the same loop, between drains.
//! Handlers only read storage; every write they cause is queued on
//! [`Persistence`] and happens in the sweep.

use crate::auth::TokenIssuer;
use crate::commands::{clean_name, Command};
use crate::config::ServerConfig;
use crate::error::{Outcome, Rejection, ServerError};
use crate::persistence::{Persistence, SaveReport};
use crate::socket::{Inbound, Outbound, Socket, Transport};
use crate::storage::{
    Storage, StorageError, User, SCHEMA_VERSION, SETTINGS_KEY, SPAWN_KEY, VERSION_KEY,
};
use log::{debug, error, info, warn};
use serde::Serialize;
use shared::model::{DEFAULT_HEALTH, SCENE_BLUEPRINT};
use shared::{
    get_timestamp, write_packet, AppEntity, Blueprint, BlueprintId, BlueprintPatch, ChatMessage,
    ConnectParams, ConnectionId, Entity, EntityEvent, EntityId, EntityPatch, KickReason,
    LiveKitGrant, Packet, PlayerEntity, Rank, SettingsChange, Snapshot, Spawn, SpawnOp, UserId,
    World,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};

/// Close code sent to every connection when the server shuts down.
pub const GOING_AWAY: u16 = 1001;

/// Cloneable entry point for network tasks.
#[derive(Debug, Clone)]
pub struct NetworkHandle {
    queue: mpsc::UnboundedSender<Inbound>,
    next_connection: Arc<AtomicU64>,
}

impl NetworkHandle {
    /// Allocates a connection number and the channel its pump writes from.
    pub fn open(&self) -> (Transport, mpsc::UnboundedReceiver<Outbound>) {
        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::SeqCst));
        Transport::channel(id)
    }

    /// Returns false once the registry has stopped.
    pub fn enqueue(&self, inbound: Inbound) -> bool {
        self.queue.send(inbound).is_ok()
    }
}

pub struct ServerNetwork {
    config: ServerConfig,
    pub world: World,
    sockets: HashMap<UserId, Socket>,
    connections: HashMap<ConnectionId, UserId>,
    /// User records of everyone connected.
    users: HashMap<UserId, User>,
    storage: Arc<dyn Storage>,
    persistence: Persistence,
    tokens: TokenIssuer,
    queue_tx: mpsc::UnboundedSender<Inbound>,
    queue_rx: mpsc::UnboundedReceiver<Inbound>,
    next_connection: Arc<AtomicU64>,
}

impl ServerNetwork {
    pub fn new(config: ServerConfig, storage: Arc<dyn Storage>) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let tokens = TokenIssuer::new(config.token_secret.as_deref());
        Self {
            config,
            world: World::new(),
            sockets: HashMap::new(),
            connections: HashMap::new(),
            users: HashMap::new(),
            storage,
            persistence: Persistence::new(),
            tokens,
            queue_tx,
            queue_rx,
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn handle(&self) -> NetworkHandle {
        NetworkHandle {
            queue: self.queue_tx.clone(),
            next_connection: Arc::clone(&self.next_connection),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    pub fn socket(&self, id: &UserId) -> Option<&Socket> {
        self.sockets.get(id)
    }

    /// Loads settings, spawn, blueprints and apps from storage, seeding a
    /// scene for a brand new world.
    pub async fn load(&mut self) -> Result<(), ServerError> {
        if let Some(value) = self.storage.config(SETTINGS_KEY).await? {
            match serde_json::from_value(value) {
                Ok(settings) => self.world.settings = settings,
                Err(e) => warn!("Ignoring unreadable settings: {}", e),
            }
        }
        if let Some(value) = self.storage.config(SPAWN_KEY).await? {
            match serde_json::from_value(value) {
                Ok(spawn) => self.world.spawn = spawn,
                Err(e) => warn!("Ignoring unreadable spawn: {}", e),
            }
        }

        self.world.set_blueprints(self.storage.blueprints().await?);

        let mut apps = Vec::new();
        for entity in self.storage.entities().await? {
            match entity {
                Entity::App(mut app) => {
                    // nobody is moving or uploading anything after a restart
                    app.mover = None;
                    app.uploader = None;
                    apps.push(Entity::App(app));
                }
                Entity::Player(player) => warn!("Dropping stored player entity {}", player.id),
            }
        }
        self.world.set_entities(apps);

        self.storage
            .set_config(VERSION_KEY, serde_json::json!(SCHEMA_VERSION))
            .await?;

        let scene_id = BlueprintId::from(SCENE_BLUEPRINT);
        if self.world.blueprint(&scene_id).is_none() {
            let scene = Blueprint::scene();
            self.storage.save_blueprint(&scene).await?;
            self.world.add_blueprint(scene)?;

            let app = Entity::App(AppEntity::new(EntityId::generate(), scene_id));
            self.storage.save_entity(&app).await?;
            self.world.add_entity(app)?;
            info!("Seeded new world with a scene");
        }

        info!(
            "Loaded world: {} blueprints, {} apps",
            self.world.blueprints().len(),
            self.world.entity_count()
        );
        Ok(())
    }

    /// Broadcasts to every registered connection except `exclude`. The packet
    /// is encoded once.
    pub fn send(&self, packet: &Packet, exclude: Option<&UserId>) {
        let frame = match write_packet(packet) {
            Ok(frame) => Arc::new(frame),
            Err(e) => {
                error!("Failed to encode broadcast: {}", e);
                return;
            }
        };
        for (id, socket) in &self.sockets {
            if Some(id) == exclude {
                continue;
            }
            socket.send_raw(&frame);
        }
    }

    pub fn send_to(&self, id: &UserId, packet: &Packet) {
        match self.sockets.get(id) {
            Some(socket) => socket.send(packet),
            None => debug!("Not sending {} to unknown player {}", packet.name(), id),
        }
    }

    /// Queues a decoded packet from `connection` for the next drain.
    pub fn enqueue(&self, connection: ConnectionId, packet: Packet) {
        let _ = self.queue_tx.send(Inbound::Packet { connection, packet });
    }

    /// Runs every queued entry, in arrival order.
    pub async fn flush(&mut self) {
        while let Ok(inbound) = self.queue_rx.try_recv() {
            self.process(inbound).await;
        }
    }

    async fn process(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Connect { transport, params } => self.on_connection(transport, params).await,
            Inbound::Packet { connection, packet } => {
                let Some(user) = self.connections.get(&connection).cloned() else {
                    debug!(
                        "Dropping {} from unregistered connection {}",
                        packet.name(),
                        connection
                    );
                    return;
                };
                let name = packet.name();
                debug!("{} from {}", name, user);
                if let Err(rejection) = self.dispatch(&user, packet).await {
                    warn!("Rejected {} from {}: {}", name, user, rejection);
                }
            }
            Inbound::Closed { connection, code } => {
                if let Some(user) = self.connections.get(&connection).cloned() {
                    if let Some(socket) = self.sockets.get_mut(&user) {
                        socket.mark_closed();
                    }
                    self.on_disconnect(&user, code);
                }
            }
        }
    }

    /// Handshake. Every rejection sends a `kick` and closes the transport.
    pub async fn on_connection(&mut self, transport: Transport, params: ConnectParams) {
        if let Some(limit) = self.player_limit() {
            if self.sockets.len() >= limit {
                return reject(transport, KickReason::PlayerLimit);
            }
        }

        let mut user = self.resolve_user(params.auth_token.as_deref()).await;

        if self.sockets.contains_key(&user.id) {
            return reject(transport, KickReason::DuplicateUser);
        }

        if let Some(name) = params.name.as_deref().and_then(clean_name) {
            if name != user.name {
                user.name = name;
                self.persistence.mark_user(user.clone());
            }
        }

        let player = PlayerEntity {
            id: EntityId::from(&user.id),
            position: self.world.spawn.position,
            quaternion: self.world.spawn.quaternion,
            name: user.name.clone(),
            health: DEFAULT_HEALTH,
            avatar: user.avatar.clone(),
            session_avatar: params.avatar.filter(|avatar| !avatar.is_empty()),
            rank: user.rank,
            user_id: user.id.clone(),
            owner: user.id.clone(),
            entered_at: get_timestamp(),
        };
        let player = Entity::Player(player);
        if let Some(Entity::Player(stale)) = self.world.entity(player.id()) {
            warn!("Replacing stale player entity {}", stale.id);
            self.world.remove_entity(player.id());
        }
        if let Err(e) = self.world.add_entity(player.clone()) {
            error!("Failed to spawn player {}: {}", user.id, e);
            transport.close(None);
            return;
        }
        self.send(&Packet::EntityAdded(player), None);

        let socket = Socket::new(user.id.clone(), transport);
        socket.send(&Packet::Snapshot(Box::new(self.snapshot(&user))));
        self.connections.insert(socket.connection(), user.id.clone());
        self.sockets.insert(user.id.clone(), socket);

        info!(
            "Player {} ({}) connected ({} connected)",
            user.id,
            user.name,
            self.sockets.len()
        );
        self.users.insert(user.id.clone(), user);
    }

    fn player_limit(&self) -> Option<usize> {
        self.world
            .settings
            .player_limit
            .map(|limit| limit as usize)
            .or(self.config.player_limit)
    }

    /// Looks up the user behind a token. Missing, invalid or unknown tokens
    /// get a new anonymous user.
    async fn resolve_user(&mut self, token: Option<&str>) -> User {
        match token.map(|token| self.tokens.verify(token)) {
            Some(Some(id)) => match self.find_user(&id).await {
                Ok(Some(user)) => return user,
                Ok(None) => debug!("Auth token for unknown user {}", id),
                Err(e) => error!("Failed to load user {}: {}", id, e),
            },
            Some(None) => debug!("Ignoring invalid auth token"),
            None => {}
        }

        let user = User::anonymous();
        self.persistence.mark_user(user.clone());
        user
    }

    /// Newest known record for `id`: connected, queued for the next sweep, or
    /// stored.
    async fn find_user(&self, id: &UserId) -> Result<Option<User>, StorageError> {
        if let Some(user) = self
            .users
            .get(id)
            .or_else(|| self.persistence.pending_user(id))
        {
            return Ok(Some(user.clone()));
        }
        self.storage.user(id).await
    }

    fn snapshot(&self, user: &User) -> Snapshot {
        Snapshot {
            id: user.id.clone(),
            server_time: get_timestamp(),
            assets_url: self.config.assets_url(),
            api_url: self.config.api_url(),
            max_upload_size: self.config.max_upload_size,
            collections: self.world.collections.clone(),
            settings: self.world.settings.clone(),
            chat: self.world.chat(),
            blueprints: self.world.blueprints(),
            entities: self.world.entities(),
            livekit: self.config.livekit_url.as_ref().map(|url| LiveKitGrant {
                ws_url: url.clone(),
                room: self.config.world_name(),
                identity: user.id.clone(),
            }),
            auth_token: self.tokens.issue(&user.id),
            has_admin_code: self.config.admin_code.is_some(),
        }
    }

    async fn dispatch(&mut self, user: &UserId, packet: Packet) -> Outcome {
        match packet {
            Packet::ChatAdded(message) => self.on_chat_added(user, message),
            Packet::Command(words) => self.on_command(user, words),
            Packet::EntityAdded(entity) => self.on_entity_added(user, entity).await,
            Packet::EntityModified(patch) => self.on_entity_modified(user, patch),
            Packet::EntityRemoved(id) => self.on_entity_removed(user, id),
            Packet::EntityEvent(event) => self.on_entity_event(user, event),
            Packet::BlueprintAdded(blueprint) => self.on_blueprint_added(user, blueprint),
            Packet::BlueprintModified(patch) => self.on_blueprint_modified(user, patch),
            Packet::SettingsModified(change) => self.on_settings_modified(user, change),
            Packet::SpawnModified(op) => self.on_spawn_modified(user, op),
            Packet::KickPlayer(target) => self.on_kick(user, target),
            Packet::Mute { player_id, muted } => self.on_mute(user, player_id, muted),
            Packet::ModifyRank { player_id, rank } => {
                self.on_modify_rank(user, player_id, rank)
            }
            Packet::Ping(time) => {
                self.send_to(user, &Packet::Pong(time));
                Ok(())
            }
            other => Err(Rejection::Invalid(format!(
                "{} is not accepted from clients",
                other.name()
            ))),
        }
    }

    fn rank_of(&self, user: &UserId) -> Rank {
        self.world
            .player(user)
            .map(|player| player.rank)
            .unwrap_or_default()
            .effective(self.world.settings.public)
    }

    fn require(&self, user: &UserId, required: Rank) -> Outcome {
        let actual = self.rank_of(user);
        if actual < required {
            return Err(Rejection::Unauthorized { required, actual });
        }
        Ok(())
    }

    fn require_outranks(&self, actor: &UserId, target: &UserId) -> Outcome {
        let target_rank = self
            .world
            .player(target)
            .ok_or_else(|| Rejection::NotFound(format!("player {}", target)))?
            .rank
            .effective(self.world.settings.public);
        let actor_rank = self.rank_of(actor);
        if !actor_rank.outranks(target_rank) {
            return Err(Rejection::Outranked {
                actor: actor_rank,
                target: target_rank,
            });
        }
        Ok(())
    }

    fn on_chat_added(&mut self, user: &UserId, message: ChatMessage) -> Outcome {
        self.world.add_chat(message.clone());
        self.send(&Packet::ChatAdded(message), Some(user));
        Ok(())
    }

    fn on_command(&mut self, user: &UserId, words: Vec<String>) -> Outcome {
        let command = Command::parse(&words)
            .ok_or_else(|| Rejection::Invalid("empty command".to_string()))?;
        match command {
            Command::Admin(code) => {
                let Some(expected) = self.config.admin_code.as_deref() else {
                    return Err(Rejection::Invalid("no admin code configured".to_string()));
                };
                if code.as_deref() != Some(expected) {
                    return Err(Rejection::Invalid("wrong admin code".to_string()));
                }
                let current = self
                    .world
                    .player(user)
                    .map(|player| player.rank)
                    .unwrap_or_default();
                let rank = if current.is_admin() {
                    Rank::Visitor
                } else {
                    Rank::Admin
                };
                self.set_rank(user, rank)
            }
            Command::Name(name) => {
                let name = clean_name(&name)
                    .ok_or_else(|| Rejection::Invalid(format!("bad name {:?}", name)))?;
                let mut patch = EntityPatch::new(EntityId::from(user));
                patch.name = Some(name.clone());
                self.world
                    .modify_entity(&patch)
                    .map_err(|_| Rejection::NotFound(format!("player {}", user)))?;
                self.send(&Packet::EntityModified(patch), None);
                self.update_user(user, move |record| record.name = name);
                Ok(())
            }
            Command::Spawn(op) => self.on_spawn_modified(user, op),
            Command::ClearChat => {
                self.require(user, Rank::Builder)?;
                self.world.clear_chat();
                self.send(&Packet::ChatCleared, None);
                Ok(())
            }
            Command::Unknown(line) => {
                Err(Rejection::Invalid(format!("unknown command /{}", line)))
            }
        }
    }

    /// Player entities share their user's id, so an app may never take the id
    /// of a known user, online or not.
    async fn on_entity_added(&mut self, user: &UserId, entity: Entity) -> Outcome {
        self.require(user, Rank::Builder)?;
        if entity.is_player() {
            return Err(Rejection::Invalid(
                "player entities are spawned by the server".to_string(),
            ));
        }
        let id = entity.id().clone();
        let owner = UserId::from(id.as_str());
        match self.find_user(&owner).await {
            Ok(None) => {}
            Ok(Some(_)) => {
                return Err(Rejection::Invalid(format!(
                    "entity id {} belongs to a player",
                    id
                )))
            }
            Err(e) => {
                return Err(Rejection::Invalid(format!(
                    "cannot check entity id {}: {}",
                    id, e
                )))
            }
        }
        self.world
            .add_entity(entity.clone())
            .map_err(|e| Rejection::Invalid(e.to_string()))?;
        self.send(&Packet::EntityAdded(entity), Some(user));
        self.persistence.mark_app(id);
        Ok(())
    }

    /// Apps are open to every connection, whoever holds `mover`. Player
    /// entities only accept changes from their own connection, and never
    /// a rank change.
    fn on_entity_modified(&mut self, user: &UserId, patch: EntityPatch) -> Outcome {
        if patch.rank.is_some() {
            return Err(Rejection::Invalid(
                "rank changes go through modifyRank".to_string(),
            ));
        }
        let is_player = match self.world.entity(&patch.id) {
            None => return Err(Rejection::NotFound(format!("entity {}", patch.id))),
            Some(Entity::Player(player)) if &player.user_id != user => {
                return Err(Rejection::NotOwner)
            }
            Some(entity) => entity.is_player(),
        };

        self.world
            .modify_entity(&patch)
            .map_err(|e| Rejection::NotFound(e.to_string()))?;
        self.send(&Packet::EntityModified(patch.clone()), Some(user));

        if !is_player {
            self.persistence.mark_app(patch.id);
        } else if patch.name.is_some() || patch.avatar.is_some() {
            let EntityPatch { name, avatar, .. } = patch;
            self.update_user(user, move |record| {
                if let Some(name) = name {
                    record.name = name;
                }
                if let Some(avatar) = avatar {
                    record.avatar = avatar;
                }
            });
        }
        Ok(())
    }

    fn on_entity_removed(&mut self, user: &UserId, id: EntityId) -> Outcome {
        self.require(user, Rank::Builder)?;
        match self.world.entity(&id) {
            None => return Err(Rejection::NotFound(format!("entity {}", id))),
            Some(Entity::Player(_)) => {
                return Err(Rejection::Invalid(
                    "player entities cannot be removed".to_string(),
                ))
            }
            Some(Entity::App(_)) => {}
        }
        self.world.remove_entity(&id);
        self.send(&Packet::EntityRemoved(id.clone()), Some(user));
        self.persistence.mark_app(id);
        Ok(())
    }

    fn on_entity_event(&mut self, user: &UserId, event: EntityEvent) -> Outcome {
        if !self.world.has_entity(&event.entity_id) {
            return Err(Rejection::NotFound(format!("entity {}", event.entity_id)));
        }
        self.send(&Packet::EntityEvent(event), Some(user));
        Ok(())
    }

    fn on_blueprint_added(&mut self, user: &UserId, blueprint: Blueprint) -> Outcome {
        self.require(user, Rank::Builder)?;
        let id = blueprint.id.clone();
        self.world
            .add_blueprint(blueprint.clone())
            .map_err(|e| Rejection::Invalid(e.to_string()))?;
        self.send(&Packet::BlueprintAdded(blueprint), Some(user));
        self.persistence.mark_blueprint(id);
        Ok(())
    }

    /// Accepts only strictly newer versions. A stale sender gets the stored
    /// blueprint back so it can revert.
    fn on_blueprint_modified(&mut self, user: &UserId, patch: BlueprintPatch) -> Outcome {
        self.require(user, Rank::Builder)?;
        let stored = self
            .world
            .blueprint(&patch.id)
            .ok_or_else(|| Rejection::NotFound(format!("blueprint {}", patch.id)))?;
        if patch.version <= stored.version {
            let conflict = Rejection::Conflict {
                incoming: patch.version,
                stored: stored.version,
            };
            self.send_to(user, &Packet::BlueprintModified(BlueprintPatch::from(stored)));
            return Err(conflict);
        }

        self.world
            .modify_blueprint(&patch)
            .map_err(|e| Rejection::NotFound(e.to_string()))?;
        self.send(&Packet::BlueprintModified(patch.clone()), Some(user));
        self.persistence.mark_blueprint(patch.id);
        Ok(())
    }

    fn on_settings_modified(&mut self, user: &UserId, change: SettingsChange) -> Outcome {
        self.require(user, Rank::Admin)?;
        self.world.settings.apply(&change);
        self.send(&Packet::SettingsModified(change), Some(user));
        let settings = self.world.settings.clone();
        self.save_config(SETTINGS_KEY, &settings);
        Ok(())
    }

    fn on_spawn_modified(&mut self, user: &UserId, op: SpawnOp) -> Outcome {
        self.require(user, Rank::Admin)?;
        self.world.spawn = match op {
            SpawnOp::Set => {
                let player = self
                    .world
                    .player(user)
                    .ok_or_else(|| Rejection::NotFound(format!("player {}", user)))?;
                Spawn {
                    position: player.position,
                    quaternion: player.quaternion,
                }
            }
            SpawnOp::Clear => Spawn::default(),
        };
        let spawn = self.world.spawn;
        self.save_config(SPAWN_KEY, &spawn);
        info!("Spawn {:?} by {}", op, user);
        Ok(())
    }

    fn on_kick(&mut self, user: &UserId, target: UserId) -> Outcome {
        self.require(user, Rank::Builder)?;
        self.require_outranks(user, &target)?;
        let socket = self
            .sockets
            .get(&target)
            .ok_or_else(|| Rejection::NotFound(format!("connection {}", target)))?;
        socket.send(&Packet::Kick(KickReason::Moderation));
        self.on_disconnect(&target, None);
        info!("{} kicked {}", user, target);
        Ok(())
    }

    fn on_mute(&mut self, user: &UserId, target: UserId, muted: bool) -> Outcome {
        self.require(user, Rank::Builder)?;
        self.require_outranks(user, &target)?;
        self.send(
            &Packet::Mute {
                player_id: target,
                muted,
            },
            None,
        );
        Ok(())
    }

    fn on_modify_rank(&mut self, user: &UserId, target: UserId, rank: Rank) -> Outcome {
        self.require(user, Rank::Admin)?;
        self.set_rank(&target, rank)
    }

    fn set_rank(&mut self, target: &UserId, rank: Rank) -> Outcome {
        if self.world.player(target).is_none() {
            return Err(Rejection::NotFound(format!("player {}", target)));
        }
        let mut patch = EntityPatch::new(EntityId::from(target));
        patch.rank = Some(rank);
        self.world
            .modify_entity(&patch)
            .map_err(|e| Rejection::NotFound(e.to_string()))?;
        self.send(&Packet::EntityModified(patch), None);
        self.update_user(target, move |record| record.rank = rank);
        info!("{} is now {:?}", target, rank);
        Ok(())
    }

    /// Applies `update` to a connected user's record and queues it for the
    /// next sweep.
    fn update_user(&mut self, id: &UserId, update: impl FnOnce(&mut User)) {
        let Some(user) = self.users.get_mut(id) else {
            warn!("No user record for {}", id);
            return;
        };
        update(user);
        self.persistence.mark_user(user.clone());
    }

    fn save_config<T: Serialize>(&mut self, key: &str, value: &T) {
        match serde_json::to_value(value) {
            Ok(value) => self.persistence.mark_config(key, value),
            Err(e) => error!("Failed to encode {}: {}", key, e),
        }
    }

    /// Tears a connection down once: removes its player entity, releases
    /// anything it held and unregisters it.
    pub fn on_disconnect(&mut self, user: &UserId, code: Option<u16>) {
        let Some(socket) = self.sockets.get_mut(user) else {
            return;
        };
        if !socket.disconnect(code) {
            return;
        }
        let Some(socket) = self.sockets.remove(user) else {
            return;
        };
        self.connections.remove(&socket.connection());
        self.users.remove(user);

        if self.world.remove_entity(&socket.player).is_some() {
            self.send(&Packet::EntityRemoved(socket.player.clone()), None);
        }
        self.release_locks(user);

        info!(
            "Player {} disconnected ({} connected)",
            user,
            self.sockets.len()
        );
    }

    fn release_locks(&mut self, user: &UserId) {
        let held: Vec<EntityPatch> = self
            .world
            .apps()
            .filter_map(|app| {
                let moving = app.mover.as_ref() == Some(user);
                let uploading = app.uploader.as_ref() == Some(user);
                if !moving && !uploading {
                    return None;
                }
                let mut patch = EntityPatch::new(app.id.clone());
                if moving {
                    patch.mover = Some(None);
                }
                if uploading {
                    patch.uploader = Some(None);
                }
                Some(patch)
            })
            .collect();

        for patch in held {
            if self.world.modify_entity(&patch).is_ok() {
                debug!("Released {} held by {}", patch.id, user);
                self.send(&Packet::EntityModified(patch.clone()), None);
                self.persistence.mark_app(patch.id);
            }
        }
    }

    /// Disconnects connections that missed the previous probe, then probes
    /// the rest.
    pub fn check_sockets(&mut self) {
        let dead: Vec<UserId> = self
            .sockets
            .values()
            .filter(|socket| !socket.is_alive())
            .map(|socket| socket.id.clone())
            .collect();
        for id in dead {
            warn!("Player {} missed a heartbeat, disconnecting", id);
            self.on_disconnect(&id, None);
        }
        for socket in self.sockets.values() {
            socket.ping();
        }
    }

    pub async fn save(&mut self) -> SaveReport {
        self.persistence
            .save(&self.world, self.storage.as_ref())
            .await
    }

    /// Main loop: drains the queue every tick, probes liveness every ping
    /// interval and saves every save interval until `shutdown` flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = interval(self.config.tick_duration());
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut liveness = interval(self.config.ping_interval);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the first tick since it fires immediately
        liveness.tick().await;

        let save_interval = self.config.save_interval;
        let mut saves = interval(if save_interval.is_zero() {
            Duration::from_secs(3600)
        } else {
            save_interval
        });
        saves.tick().await;

        info!(
            "Network loop running at {} Hz, saving every {:?}",
            self.config.tick_rate, save_interval
        );

        loop {
            tokio::select! {
                _ = tick.tick() => self.flush().await,
                _ = liveness.tick() => self.check_sockets(),
                _ = saves.tick(), if !save_interval.is_zero() => {
                    self.save().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Network loop shutting down");
        self.flush().await;
        let ids: Vec<UserId> = self.sockets.keys().cloned().collect();
        for id in ids {
            self.on_disconnect(&id, Some(GOING_AWAY));
        }
        let report = self.save().await;
        info!(
            "Final save: {} upserted, {} deleted, {} failed",
            report.upserted, report.deleted, report.failed
        );
    }
}

fn reject(transport: Transport, reason: KickReason) {
    info!("Rejecting connection {}: {}", transport.id, reason.code());
    if let Err(e) = transport.send(&Packet::Kick(reason)) {
        error!("Failed to send kick to {}: {}", transport.id, e);
    }
    transport.close(None);
}
