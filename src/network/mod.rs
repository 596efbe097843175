//! Network Layer
//!
//! Sessions, wire messages and the WebSocket front end.
//! The game thread only sees this layer through [`transport`] queues.

pub mod protocol;
pub mod transport;
pub mod connection;
pub mod manager;
pub mod server;

pub use protocol::{ClientMessage, GameMessage};
pub use transport::{IngressEvent, TransportHandle, TransportError};
pub use connection::{PlayerConnection, PendingTeleport};
pub use manager::{ConnectionSettings, PlayerConnectionManager};
pub use server::{GameServer, GameServerError};
