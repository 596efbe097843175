//! Game Simulation Module
//!
//! Everything that runs on a game instance's thread.
//!
//! ## Module Structure
//!
//! - `scheduler`: Time-ordered events with cancellable pointers
//! - `tick`: Fixed-timestep clock with catch-up and time-skip
//! - `properties`: Typed property values and collections
//! - `prototype`: Read-only entity and property definitions
//! - `region`: Regions and their cell grids
//! - `locomotion`: Movement toward a destination
//! - `entity`: Entities, locations and inventories
//! - `factory`: Entity construction by kind
//! - `entity_manager`: Live entity set and deferred create/destroy lists
//! - `aoi`: Per-session area of interest
//! - `crash`: Crash report files
//! - `instance`: The game instance and its loop

pub mod scheduler;
pub mod tick;
pub mod properties;
pub mod prototype;
pub mod region;
pub mod locomotion;
pub mod entity;
pub mod factory;
pub mod entity_manager;
pub mod aoi;
pub mod crash;
pub mod instance;

// Re-export key types
pub use scheduler::{EventScheduler, EventPointer, ScheduledEvent};
pub use tick::{FixedTimestep, FrameReport};
pub use properties::{PropertyId, PropertyValue, PropertyCollection};
pub use prototype::{PrototypeTable, EntityPrototype, PropertyInfo};
pub use region::{Bounds, Region, RegionManager};
pub use entity::{Entity, EntityKind};
pub use entity_manager::{EntityManager, EntitySettings, Placement};
pub use aoi::{AreaOfInterest, InterestTransition};
pub use instance::{Game, GameHandle, GameState, GameShutdownReason, GameError, World};
