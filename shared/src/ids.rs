//! Identifier newtypes.
//!
//! A player's user id, the id of their player entity and the key of their
//! server connection are the same string on the wire, but they are kept as
//! separate types so they cannot be mixed up by accident. Conversions between
//! them are explicit.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Generates a fresh random id.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().simple().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Stable id of a user record. Also keys the user's live connection.
    UserId
);
string_id!(
    /// Id of an entity in the world (player or app).
    EntityId
);
string_id!(
    /// Id of a blueprint.
    BlueprintId
);

impl From<&UserId> for EntityId {
    /// Player entities reuse their owner's user id.
    fn from(user: &UserId) -> Self {
        EntityId(user.0.clone())
    }
}

/// Transport-level connection number assigned by the server front door.
///
/// A user id only becomes attached to a connection once the handshake
/// succeeds, so frames are tagged with this number until then.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = UserId::generate();
        let b = UserId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn test_player_entity_id_matches_user() {
        let user = UserId::from("abc");
        let entity = EntityId::from(&user);
        assert_eq!(entity.as_str(), "abc");
    }

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let id = BlueprintId::from("$scene");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"$scene\"");
    }
}
