//! Wire protocol: every message exchanged over the duplex connection.
//!
//! A frame is one bincode-encoded [`Packet`] (varint integers, little endian).
//! The variant tag doubles as the method id, so the method name costs a
//! single byte on the wire. Free-form JSON inside packets travels as text.

use crate::ids::{BlueprintId, EntityId, UserId};
use crate::model::{
    Blueprint, BlueprintPatch, ChatMessage, Entity, EntityEvent, EntityPatch, KickReason,
    SettingsChange, Snapshot, SpawnOp, Vec3,
};
use crate::ranks::Rank;
use bincode::Options;
use serde::{Deserialize, Serialize};

/// Largest frame either side will encode or accept.
pub const MAX_FRAME_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode {name}: {source}")]
    Encode {
        name: &'static str,
        source: bincode::Error,
    },

    #[error("malformed frame ({len} bytes): {source}")]
    Decode { len: usize, source: bincode::Error },

    #[error("empty frame")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Packet {
    /// S→C bootstrap state, sent once per connection.
    Snapshot(Box<Snapshot>),
    /// S→C reason code, followed by the server closing the connection.
    Kick(KickReason),
    /// C→S moderation request to kick another player.
    KickPlayer(UserId),
    /// C→S slash command split into words, e.g. `["admin", "secret"]`.
    Command(Vec<String>),
    ChatAdded(ChatMessage),
    ChatCleared,
    BlueprintAdded(Blueprint),
    BlueprintModified(BlueprintPatch),
    EntityAdded(Entity),
    EntityModified(EntityPatch),
    EntityRemoved(EntityId),
    EntityEvent(EntityEvent),
    SettingsModified(SettingsChange),
    SpawnModified(SpawnOp),
    ModifyRank {
        player_id: UserId,
        rank: Rank,
    },
    /// C→S moderation request, S→C voice state notification.
    Mute {
        player_id: UserId,
        muted: bool,
    },
    LiveKitLevel {
        player_id: UserId,
        level: f32,
    },
    PlayerTeleport {
        position: Vec3,
        rotation_y: Option<f32>,
    },
    PlayerPush {
        force: Vec3,
    },
    PlayerSessionAvatar {
        avatar: Option<String>,
    },
    /// C→S client timestamp, echoed back in `Pong`.
    Ping(u64),
    Pong(u64),
}

impl Packet {
    /// Method name of the packet, as used in logs and handler tables.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Snapshot(_) => "snapshot",
            Packet::Kick(_) | Packet::KickPlayer(_) => "kick",
            Packet::Command(_) => "command",
            Packet::ChatAdded(_) => "chatAdded",
            Packet::ChatCleared => "chatCleared",
            Packet::BlueprintAdded(_) => "blueprintAdded",
            Packet::BlueprintModified(_) => "blueprintModified",
            Packet::EntityAdded(_) => "entityAdded",
            Packet::EntityModified(_) => "entityModified",
            Packet::EntityRemoved(_) => "entityRemoved",
            Packet::EntityEvent(_) => "entityEvent",
            Packet::SettingsModified(_) => "settingsModified",
            Packet::SpawnModified(_) => "spawnModified",
            Packet::ModifyRank { .. } => "modifyRank",
            Packet::Mute { .. } => "mute",
            Packet::LiveKitLevel { .. } => "liveKitLevel",
            Packet::PlayerTeleport { .. } => "playerTeleport",
            Packet::PlayerPush { .. } => "playerPush",
            Packet::PlayerSessionAvatar { .. } => "playerSessionAvatar",
            Packet::Ping(_) => "ping",
            Packet::Pong(_) => "pong",
        }
    }

    /// Blueprint id carried by blueprint packets.
    pub fn blueprint_id(&self) -> Option<&BlueprintId> {
        match self {
            Packet::BlueprintAdded(blueprint) => Some(&blueprint.id),
            Packet::BlueprintModified(patch) => Some(&patch.id),
            _ => None,
        }
    }
}

fn options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_FRAME_SIZE)
}

/// Encodes one packet into a frame.
pub fn write_packet(packet: &Packet) -> Result<Vec<u8>, CodecError> {
    options()
        .serialize(packet)
        .map_err(|source| CodecError::Encode {
            name: packet.name(),
            source,
        })
}

/// Decodes one frame. Trailing bytes are rejected.
pub fn read_packet(frame: &[u8]) -> Result<Packet, CodecError> {
    if frame.is_empty() {
        return Err(CodecError::Empty);
    }
    options()
        .deserialize(frame)
        .map_err(|source| CodecError::Decode {
            len: frame.len(),
            source,
        })
}
