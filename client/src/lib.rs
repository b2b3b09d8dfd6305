//! # World Client Library
//!
//! Headless client for the world server. It keeps a replica of the world in
//! sync with the server and exposes the calls a front end would build on.
//!
//! ## How a session runs
//!
//! 1. [`network::ClientNetwork::init`] opens the WebSocket, passing the
//!    persisted auth token and the optional name/avatar hints as query
//!    parameters.
//! 2. Incoming frames are decoded by a reader task and queued. Nothing touches
//!    the world until [`network::ClientNetwork::flush`] runs on the next tick,
//!    which applies the queue in arrival order.
//! 3. The first packet is the snapshot: the clock offset is taken, preloadable
//!    assets are queued, then collections, settings, chat, blueprints and
//!    entities are replaced wholesale and the returned token is saved.
//! 4. Deltas follow. Anything the caller needs to react to is reported as a
//!    [`events::ClientEvent`].
//! 5. When the connection drops a system chat line is added and a
//!    `Disconnected` event is emitted. The client does not reconnect.
//!
//! Uploads go through the HTTP side-channel in [`upload`]: a file is named by
//! its content hash and only sent when the server reports it missing.
//!
//! ## Modules
//!
//! - [`network`]: the client session
//! - [`upload`]: content-addressed uploader
//! - [`preload`]: asset preload queue
//! - [`token`]: auth token persistence
//! - [`events`]: session events
//! - [`config`]: command line configuration

pub mod config;
pub mod error;
pub mod events;
pub mod network;
pub mod preload;
pub mod token;
pub mod upload;

pub use config::ClientConfig;
pub use error::ClientError;
pub use events::ClientEvent;
pub use network::ClientNetwork;
pub use token::TokenStore;
