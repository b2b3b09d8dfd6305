//! Protocol and world types shared by the server and the client.
//!
//! - [`packets`]: the binary wire codec and the [`Packet`] message set
//! - [`model`]: blueprints, entities, chat, settings and the bootstrap [`Snapshot`]
//! - [`world`]: the in-memory world state both sides replicate into
//! - [`ranks`]: permission levels
//! - [`ids`]: identifier newtypes

pub mod ids;
pub mod model;
pub mod packets;
pub mod ranks;
pub mod world;

pub use ids::{BlueprintId, ConnectionId, EntityId, UserId};
pub use model::{
    AppEntity, Blueprint, BlueprintPatch, ChatMessage, Collection, ConnectParams, Entity,
    EntityEvent, EntityPatch, Json, KickReason, LiveKitGrant, PlayerEntity, Quat, Settings,
    SettingsChange, Snapshot, Spawn, SpawnOp, Vec3,
};
pub use packets::{read_packet, write_packet, CodecError, Packet};
pub use ranks::Rank;
pub use world::{World, WorldError};

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Fixed-update rate both sides drain their inbound queues at.
pub const DEFAULT_TICK_RATE: u32 = 50;

/// Current timestamp in milliseconds since the unix epoch.
pub fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// Splits a chat line starting with `/` into command words.
pub fn parse_command(line: &str) -> Option<Vec<String>> {
    let body = line.strip_prefix('/')?;
    let words: Vec<String> = body.split_whitespace().map(str::to_string).collect();
    if words.is_empty() {
        None
    } else {
        Some(words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_is_monotonic_enough() {
        let first = get_timestamp();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(get_timestamp() > first);
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(
            parse_command("/admin  hunter2"),
            Some(vec!["admin".to_string(), "hunter2".to_string()])
        );
        assert_eq!(parse_command("hello"), None);
        assert_eq!(parse_command("/"), None);
    }
}
