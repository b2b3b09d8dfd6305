//! Replicated world data: blueprints, entities, chat, settings and the
//! bootstrap snapshot.

use crate::ids::{BlueprintId, EntityId, UserId};
use crate::ranks::Rank;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub type Vec3 = [f32; 3];
pub type Quat = [f32; 4];

pub const IDENTITY: Quat = [0.0, 0.0, 0.0, 1.0];
pub const ORIGIN: Vec3 = [0.0, 0.0, 0.0];
pub const UNIT_SCALE: Vec3 = [1.0, 1.0, 1.0];

/// Id of the singleton environment blueprint.
pub const SCENE_BLUEPRINT: &str = "$scene";

pub const DEFAULT_PLAYER_NAME: &str = "Anonymous";
pub const DEFAULT_HEALTH: u32 = 100;

/// Free-form JSON carried inside typed packets (blueprint props, app state,
/// entity event data).
///
/// Self-describing formats see the value as-is. Binary formats that cannot
/// deserialize arbitrary values get it as a JSON string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Json(pub serde_json::Value);

impl Json {
    pub fn null() -> Self {
        Json(serde_json::Value::Null)
    }

    pub fn object() -> Self {
        Json(serde_json::Value::Object(serde_json::Map::new()))
    }
}

impl From<serde_json::Value> for Json {
    fn from(value: serde_json::Value) -> Self {
        Json(value)
    }
}

impl Serialize for Json {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            self.0.serialize(serializer)
        } else {
            let text = serde_json::to_string(&self.0).map_err(serde::ser::Error::custom)?;
            serializer.serialize_str(&text)
        }
    }
}

impl<'de> Deserialize<'de> for Json {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            serde_json::Value::deserialize(deserializer).map(Json)
        } else {
            let text = String::deserialize(deserializer)?;
            serde_json::from_str(&text)
                .map(Json)
                .map_err(serde::de::Error::custom)
        }
    }
}

/// Persistent template an app entity is instantiated from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blueprint {
    pub id: BlueprintId,
    /// Optimistic concurrency counter, see `BlueprintPatch`.
    pub version: u32,
    pub name: String,
    pub model: Option<String>,
    pub script: Option<String>,
    pub props: Json,
    #[serde(default)]
    pub preload: bool,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub frozen: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub scene: bool,
    #[serde(default)]
    pub disabled: bool,
}

impl Blueprint {
    pub fn new(id: BlueprintId, name: impl Into<String>) -> Self {
        Self {
            id,
            version: 0,
            name: name.into(),
            model: None,
            script: None,
            props: Json::object(),
            preload: false,
            public: false,
            locked: false,
            frozen: false,
            unique: false,
            scene: false,
            disabled: false,
        }
    }

    /// The environment blueprint every new world starts with.
    pub fn scene() -> Self {
        let mut blueprint = Blueprint::new(BlueprintId::from(SCENE_BLUEPRINT), "Scene");
        blueprint.model = Some("asset://scene.glb".to_string());
        blueprint.preload = true;
        blueprint.unique = true;
        blueprint.scene = true;
        blueprint
    }
}

/// Partial blueprint change. `version` must exceed the stored version for the
/// server to accept it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintPatch {
    pub id: BlueprintId,
    pub version: u32,
    pub name: Option<String>,
    pub model: Option<Option<String>>,
    pub script: Option<Option<String>>,
    pub props: Option<Json>,
    pub preload: Option<bool>,
    pub public: Option<bool>,
    pub locked: Option<bool>,
    pub frozen: Option<bool>,
    pub unique: Option<bool>,
    pub scene: Option<bool>,
    pub disabled: Option<bool>,
}

impl BlueprintPatch {
    pub fn new(id: BlueprintId, version: u32) -> Self {
        Self {
            id,
            version,
            ..Default::default()
        }
    }

    /// Writes every field present in the patch, including the version.
    pub fn apply_to(&self, blueprint: &mut Blueprint) {
        blueprint.version = self.version;
        if let Some(name) = &self.name {
            blueprint.name = name.clone();
        }
        if let Some(model) = &self.model {
            blueprint.model = model.clone();
        }
        if let Some(script) = &self.script {
            blueprint.script = script.clone();
        }
        if let Some(props) = &self.props {
            blueprint.props = props.clone();
        }
        let flags = [
            (self.preload, &mut blueprint.preload),
            (self.public, &mut blueprint.public),
            (self.locked, &mut blueprint.locked),
            (self.frozen, &mut blueprint.frozen),
            (self.unique, &mut blueprint.unique),
            (self.scene, &mut blueprint.scene),
            (self.disabled, &mut blueprint.disabled),
        ];
        for (value, field) in flags {
            if let Some(value) = value {
                *field = value;
            }
        }
    }
}

impl From<&Blueprint> for BlueprintPatch {
    /// A patch carrying the complete blueprint, used to overwrite stale copies.
    fn from(blueprint: &Blueprint) -> Self {
        Self {
            id: blueprint.id.clone(),
            version: blueprint.version,
            name: Some(blueprint.name.clone()),
            model: Some(blueprint.model.clone()),
            script: Some(blueprint.script.clone()),
            props: Some(blueprint.props.clone()),
            preload: Some(blueprint.preload),
            public: Some(blueprint.public),
            locked: Some(blueprint.locked),
            frozen: Some(blueprint.frozen),
            unique: Some(blueprint.unique),
            scene: Some(blueprint.scene),
            disabled: Some(blueprint.disabled),
        }
    }
}

/// Session-scoped avatar of a connected user. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerEntity {
    pub id: EntityId,
    pub position: Vec3,
    pub quaternion: Quat,
    pub name: String,
    pub health: u32,
    pub avatar: Option<String>,
    pub session_avatar: Option<String>,
    pub rank: Rank,
    /// Same value as `owner`; both are kept for wire compatibility.
    pub user_id: UserId,
    pub owner: UserId,
    pub entered_at: u64,
}

/// Placeable instance of a blueprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppEntity {
    pub id: EntityId,
    pub blueprint: BlueprintId,
    pub position: Vec3,
    pub quaternion: Quat,
    pub scale: Vec3,
    /// User currently dragging the app.
    pub mover: Option<UserId>,
    /// User whose asset upload backs this app and has not finished yet.
    pub uploader: Option<UserId>,
    #[serde(default)]
    pub pinned: bool,
    pub state: Json,
}

impl AppEntity {
    pub fn new(id: EntityId, blueprint: BlueprintId) -> Self {
        Self {
            id,
            blueprint,
            position: ORIGIN,
            quaternion: IDENTITY,
            scale: UNIT_SCALE,
            mover: None,
            uploader: None,
            pinned: false,
            state: Json::object(),
        }
    }

    /// Apps are only written to storage once nobody is moving or uploading them.
    pub fn is_settled(&self) -> bool {
        self.mover.is_none() && self.uploader.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    Player(PlayerEntity),
    App(AppEntity),
}

impl Entity {
    pub fn id(&self) -> &EntityId {
        match self {
            Entity::Player(player) => &player.id,
            Entity::App(app) => &app.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Entity::Player(_) => "player",
            Entity::App(_) => "app",
        }
    }

    pub fn is_app(&self) -> bool {
        matches!(self, Entity::App(_))
    }

    pub fn is_player(&self) -> bool {
        matches!(self, Entity::Player(_))
    }

    pub fn as_player(&self) -> Option<&PlayerEntity> {
        match self {
            Entity::Player(player) => Some(player),
            Entity::App(_) => None,
        }
    }

    pub fn as_app(&self) -> Option<&AppEntity> {
        match self {
            Entity::App(app) => Some(app),
            Entity::Player(_) => None,
        }
    }

    /// Applies the fields of `patch` that exist on this kind of entity.
    pub fn apply(&mut self, patch: &EntityPatch) {
        match self {
            Entity::Player(player) => {
                if let Some(position) = patch.position {
                    player.position = position;
                }
                if let Some(quaternion) = patch.quaternion {
                    player.quaternion = quaternion;
                }
                if let Some(name) = &patch.name {
                    player.name = name.clone();
                }
                if let Some(health) = patch.health {
                    player.health = health;
                }
                if let Some(avatar) = &patch.avatar {
                    player.avatar = avatar.clone();
                }
                if let Some(session_avatar) = &patch.session_avatar {
                    player.session_avatar = session_avatar.clone();
                }
                if let Some(rank) = patch.rank {
                    player.rank = rank;
                }
            }
            Entity::App(app) => {
                if let Some(position) = patch.position {
                    app.position = position;
                }
                if let Some(quaternion) = patch.quaternion {
                    app.quaternion = quaternion;
                }
                if let Some(scale) = patch.scale {
                    app.scale = scale;
                }
                if let Some(blueprint) = &patch.blueprint {
                    app.blueprint = blueprint.clone();
                }
                if let Some(mover) = &patch.mover {
                    app.mover = mover.clone();
                }
                if let Some(uploader) = &patch.uploader {
                    app.uploader = uploader.clone();
                }
                if let Some(pinned) = patch.pinned {
                    app.pinned = pinned;
                }
                if let Some(state) = &patch.state {
                    app.state = state.clone();
                }
            }
        }
    }
}

/// Partial entity change. Fields that do not exist on the target kind are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityPatch {
    pub id: EntityId,
    pub position: Option<Vec3>,
    pub quaternion: Option<Quat>,
    pub scale: Option<Vec3>,
    pub name: Option<String>,
    pub health: Option<u32>,
    pub avatar: Option<Option<String>>,
    pub session_avatar: Option<Option<String>>,
    pub rank: Option<Rank>,
    pub blueprint: Option<BlueprintId>,
    pub mover: Option<Option<UserId>>,
    pub uploader: Option<Option<UserId>>,
    pub pinned: Option<bool>,
    pub state: Option<Json>,
}

impl EntityPatch {
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }
}

/// Script-level event addressed to one entity, relayed to every other client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityEvent {
    pub entity_id: EntityId,
    pub version: u32,
    pub name: String,
    pub data: Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    /// Display name of the sender, `None` for system lines.
    pub from: Option<String>,
    pub from_id: Option<UserId>,
    pub body: String,
    pub created_at: u64,
}

impl ChatMessage {
    pub fn new(from: &PlayerEntity, body: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            from: Some(from.name.clone()),
            from_id: Some(from.user_id.clone()),
            body: body.into(),
            created_at: crate::get_timestamp(),
        }
    }

    pub fn system(body: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            from: None,
            from_id: None,
            body: body.into(),
            created_at: crate::get_timestamp(),
        }
    }
}

/// World-wide settings stored under the `settings` config key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub title: Option<String>,
    pub desc: Option<String>,
    pub image: Option<String>,
    /// Default avatar for players without one.
    pub avatar: Option<String>,
    /// Everyone may build.
    pub public: bool,
    /// Overrides the server's configured player limit when set.
    pub player_limit: Option<u32>,
}

impl Settings {
    pub fn apply(&mut self, change: &SettingsChange) {
        match change {
            SettingsChange::Title(value) => self.title = value.clone(),
            SettingsChange::Desc(value) => self.desc = value.clone(),
            SettingsChange::Image(value) => self.image = value.clone(),
            SettingsChange::Avatar(value) => self.avatar = value.clone(),
            SettingsChange::Public(value) => self.public = *value,
            SettingsChange::PlayerLimit(value) => self.player_limit = *value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SettingsChange {
    Title(Option<String>),
    Desc(Option<String>),
    Image(Option<String>),
    Avatar(Option<String>),
    Public(bool),
    PlayerLimit(Option<u32>),
}

/// Where new players appear.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Spawn {
    pub position: Vec3,
    pub quaternion: Quat,
}

impl Default for Spawn {
    fn default() -> Self {
        Self {
            position: ORIGIN,
            quaternion: IDENTITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpawnOp {
    /// Move the spawn to the requesting player's transform.
    Set,
    /// Reset the spawn to the origin.
    Clear,
}

/// Named group of blueprints offered in the builder's menu.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    pub name: String,
    pub blueprints: Vec<Blueprint>,
}

impl Collection {
    pub fn default_collection() -> Self {
        Self {
            id: "default".to_string(),
            name: "Default".to_string(),
            blueprints: Vec::new(),
        }
    }
}

/// Voice-chat connection details handed to each player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveKitGrant {
    pub ws_url: String,
    pub room: String,
    pub identity: UserId,
}

/// Reason sent with a `kick` before the server closes the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KickReason {
    DuplicateUser,
    PlayerLimit,
    Moderation,
    Other(String),
}

impl KickReason {
    pub fn code(&self) -> &str {
        match self {
            KickReason::DuplicateUser => "duplicate_user",
            KickReason::PlayerLimit => "player_limit",
            KickReason::Moderation => "moderation",
            KickReason::Other(code) => code,
        }
    }

    /// Text shown to the kicked player.
    pub fn message(&self) -> String {
        match self {
            KickReason::DuplicateUser => {
                "You are already connected to this world in another window.".to_string()
            }
            KickReason::PlayerLimit => "This world has reached its player limit.".to_string(),
            KickReason::Moderation => "You were kicked by a moderator.".to_string(),
            KickReason::Other(code) => format!("You were disconnected ({}).", code),
        }
    }
}

/// Query parameters a client attaches to its connection request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub auth_token: Option<String>,
    pub name: Option<String>,
    pub avatar: Option<String>,
}

/// Full world state sent once right after a successful handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// User id of the receiving connection.
    pub id: UserId,
    /// Server wall clock in milliseconds since the unix epoch.
    pub server_time: u64,
    pub assets_url: String,
    pub api_url: String,
    /// Largest accepted upload, in bytes.
    pub max_upload_size: u64,
    pub collections: Vec<Collection>,
    pub settings: Settings,
    pub chat: Vec<ChatMessage>,
    pub blueprints: Vec<Blueprint>,
    pub entities: Vec<Entity>,
    pub livekit: Option<LiveKitGrant>,
    pub auth_token: String,
    pub has_admin_code: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blueprint_patch_applies_present_fields_only() {
        let mut blueprint = Blueprint::new(BlueprintId::from("bp"), "Chair");
        blueprint.model = Some("asset://chair.glb".to_string());

        let mut patch = BlueprintPatch::new(blueprint.id.clone(), 3);
        patch.name = Some("Stool".to_string());
        patch.locked = Some(true);
        patch.apply_to(&mut blueprint);

        assert_eq!(blueprint.version, 3);
        assert_eq!(blueprint.name, "Stool");
        assert!(blueprint.locked);
        assert_eq!(blueprint.model.as_deref(), Some("asset://chair.glb"));
    }

    #[test]
    fn test_full_patch_restores_blueprint() {
        let original = Blueprint::scene();
        let mut drifted = original.clone();
        drifted.version = 9;
        drifted.name = "Changed".to_string();
        drifted.model = None;

        BlueprintPatch::from(&original).apply_to(&mut drifted);
        assert_eq!(drifted, original);
    }

    #[test]
    fn test_entity_patch_ignores_foreign_fields() {
        let mut app = Entity::App(AppEntity::new(
            EntityId::from("app"),
            BlueprintId::from("bp"),
        ));
        let mut patch = EntityPatch::new(EntityId::from("app"));
        patch.position = Some([1.0, 2.0, 3.0]);
        patch.name = Some("ignored".to_string());
        patch.mover = Some(Some(UserId::from("u1")));
        app.apply(&patch);

        let app = app.as_app().unwrap();
        assert_eq!(app.position, [1.0, 2.0, 3.0]);
        assert_eq!(app.mover, Some(UserId::from("u1")));
        assert!(!app.is_settled());

        let mut release = EntityPatch::new(EntityId::from("app"));
        release.mover = Some(None);
        let mut entity = Entity::App(app.clone());
        entity.apply(&release);
        assert!(entity.as_app().unwrap().is_settled());
    }

    #[test]
    fn test_json_is_natural_in_json_documents() {
        let mut blueprint = Blueprint::new(BlueprintId::from("bp"), "Lamp");
        blueprint.props = Json(serde_json::json!({ "color": "red" }));
        let text = serde_json::to_string(&blueprint).unwrap();
        assert!(text.contains("\"props\":{\"color\":\"red\"}"));

        let back: Blueprint = serde_json::from_str(&text).unwrap();
        assert_eq!(back, blueprint);
    }

    #[test]
    fn test_entity_kind_tag_in_json() {
        let app = Entity::App(AppEntity::new(EntityId::from("a"), BlueprintId::from("b")));
        let value = serde_json::to_value(&app).unwrap();
        assert!(value.get("app").is_some());
        assert_eq!(app.kind(), "app");
    }

    #[test]
    fn test_settings_changes() {
        let mut settings = Settings::default();
        settings.apply(&SettingsChange::Title(Some("Plaza".to_string())));
        settings.apply(&SettingsChange::Public(true));
        settings.apply(&SettingsChange::PlayerLimit(Some(8)));
        assert_eq!(settings.title.as_deref(), Some("Plaza"));
        assert!(settings.public);
        assert_eq!(settings.player_limit, Some(8));
    }

    #[test]
    fn test_kick_reason_codes() {
        assert_eq!(KickReason::DuplicateUser.code(), "duplicate_user");
        assert_eq!(KickReason::PlayerLimit.code(), "player_limit");
        assert_eq!(KickReason::Other("banned".to_string()).code(), "banned");
        assert!(KickReason::Moderation.message().contains("moderator"));
    }
}
