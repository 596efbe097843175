//! # Shard Core
//!
//! Authoritative game server core: fixed-timestep simulation, scheduled
//! events, an entity/region model with per-session areas of interest, and a
//! policy-gated archive codec for replication, persistence and migration.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SHARD CORE                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Ids, vectors, simulation time            │
//! │  archive/        - Bidirectional binary codec               │
//! │  ├── varint.rs   - Varint, zigzag, fixed-point floats        │
//! │  └── policy.rs   - AOI channel masks                         │
//! │                                                              │
//! │  game/           - Runs on the game thread                   │
//! │  ├── scheduler.rs- Time-ordered events                       │
//! │  ├── tick.rs     - Fixed timestep, catch-up, time-skip       │
//! │  ├── entity*.rs  - Entities, properties, inventories         │
//! │  ├── region.rs   - Regions and cells                         │
//! │  ├── aoi.rs      - Per-session interest                      │
//! │  └── instance.rs - Game loop and shutdown                    │
//! │                                                              │
//! │  network/        - Sessions and transport                    │
//! │  ├── transport.rs- Queues between sockets and game thread    │
//! │  ├── manager.rs  - Attach, detach, replicate                 │
//! │  └── server.rs   - WebSocket front end                       │
//! │                                                              │
//! │  persistence/    - Account and entity storage                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Threading
//!
//! Each game instance owns its state on one thread. Socket tasks run on
//! tokio and talk to it only through bounded queues, so nothing in `game/`
//! takes a lock.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod archive;
pub mod config;
pub mod core;
pub mod game;
pub mod network;
pub mod persistence;

// Re-export commonly used types
pub use archive::{Archive, ArchiveError, ArchivePurpose, AoiChannels, Transfer};
pub use config::{GameConfig, ServerConfig, ConfigError};
pub use crate::core::ids::{EntityId, RegionId, SessionId, GameId};
pub use crate::core::vec3::Vector3;
pub use game::instance::{Game, GameHandle, GameShutdownReason};
pub use game::scheduler::{EventScheduler, EventPointer, ScheduledEvent};
pub use network::server::GameServer;
pub use persistence::{PlayerStore, InMemoryStore};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
