//! Core primitives.
//!
//! Ids, spatial math and simulation time shared by every other module.

pub mod ids;
pub mod vec3;
pub mod time;

// Re-export core types
pub use ids::{EntityId, PrototypeId, RegionId, CellId, SessionId, GameId, AccountId};
pub use vec3::{Vector3, Orientation};
pub use time::{GameTime, Clock, MonotonicClock, ManualClock, FixedQuantumTime};
