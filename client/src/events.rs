use shared::{ChatMessage, EntityEvent, KickReason, UserId, Vec3};

/// Things the session reports to whatever sits on top of it.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Snapshot applied; `id` is this connection's user.
    Ready { id: UserId },
    Kicked(KickReason),
    Disconnected { code: Option<u16> },
    Chat(ChatMessage),
    EntityEvent(EntityEvent),
    Teleport { position: Vec3, rotation_y: Option<f32> },
    Push { force: Vec3 },
    Muted { player_id: UserId, muted: bool },
    /// Round trip of a `ping`, in milliseconds.
    Pong { rtt: u64 },
}
