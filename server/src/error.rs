use shared::{CodecError, Rank, WorldError};

use crate::assets::AssetError;
use crate::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("asset error: {0}")]
    Asset(#[from] AssetError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    World(#[from] WorldError),
}

/// Why a client message was not applied.
///
/// Rejections are logged on the server and otherwise dropped; the sender gets
/// no error packet. A stale blueprint version is the one case the sender
/// hears about, through the authoritative copy being pushed back.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Rejection {
    #[error("requires {required:?} rank, player has {actual:?}")]
    Unauthorized { required: Rank, actual: Rank },

    #[error("actor rank {actor:?} does not outrank target rank {target:?}")]
    Outranked { actor: Rank, target: Rank },

    #[error("player entities can only be modified by their owner")]
    NotOwner,

    #[error("stale version {incoming} (stored {stored})")]
    Conflict { incoming: u32, stored: u32 },

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Invalid(String),
}

/// Result of one message handler.
pub type Outcome = Result<(), Rejection>;
