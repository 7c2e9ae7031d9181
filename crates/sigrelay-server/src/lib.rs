//! sigrelay-server: WebSocket signaling relay.
//!
//! Terminates upgrade requests on the call and chat signaling routes, keeps
//! an in-memory registry of rooms and relays signaling envelopes between the
//! participants sharing a room.

pub mod config;
pub mod connection;
pub mod control;
pub mod health;
pub mod rate_limit;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod upgrade;

pub use config::{ConfigOverrides, ServerConfig};
pub use registry::RoomRegistry;
pub use server::SignalingServer;
