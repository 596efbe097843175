//! Game Instance
//!
//! One simulation instance on its own thread.
//!
//! ```text
//!   Stopped ──run()──► Running ──request_shutdown()──► ShuttingDown ──► ShutDown
//!                         │                                 ▲
//!                         └──── fault in an update ─────────┘  (crash report first)
//!
//!   each iteration:
//!     1. drain ingress (connects, disconnects, client messages)
//!     2. not due? sleep briefly, loop
//!     3. fixed updates: trigger events, locomote, flush deferred lists, replicate
//!     4. skip leftover lead
//!     5. flush egress
//! ```
//!
//! Shutdown is a single idempotent path for both a normal stop and a
//! crash: cancel events, flush, disconnect every session, release state.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::Local;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, error, info, warn};

use crate::archive::ArchiveError;
use crate::config::GameConfig;
use crate::core::ids::{GameId, RegionId, SessionId};
use crate::core::time::{Clock, GameTime, MonotonicClock};
use crate::game::crash::{CrashReport, RegionSummary};
use crate::game::entity_manager::EntityManager;
use crate::game::factory::EntityFactory;
use crate::game::prototype::PrototypeTable;
use crate::game::region::RegionManager;
use crate::game::scheduler::EventScheduler;
use crate::game::tick::{FixedTimestep, FrameReport};
use crate::network::manager::{ConnectionSettings, PlayerConnectionManager};
use crate::network::protocol::GameMessage;
use crate::network::transport::{IngressEvent, TransportHandle};
use crate::persistence::PlayerStore;

// =============================================================================
// STATE
// =============================================================================

/// Lifecycle of a game instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GameState {
    /// Built, not running.
    Stopped = 0,
    /// Loop running.
    Running = 1,
    /// Shutdown sequence in progress.
    ShuttingDown = 2,
    /// Shutdown complete.
    ShutDown = 3,
}

impl GameState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Stopped,
            1 => Self::Running,
            2 => Self::ShuttingDown,
            _ => Self::ShutDown,
        }
    }
}

/// Why a game stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameShutdownReason {
    /// Normal stop.
    ServerShuttingDown,
    /// A fixed update failed.
    GameInstanceCrash,
}

impl GameShutdownReason {
    /// Text sent to disconnected sessions.
    pub fn message(self) -> &'static str {
        match self {
            Self::ServerShuttingDown => "Server is shutting down",
            Self::GameInstanceCrash => "Game instance crashed",
        }
    }
}

/// Game errors.
#[derive(Debug, thiserror::Error)]
pub enum GameError {
    /// Replication failed inside a fixed update.
    #[error("Archive error during update: {0}")]
    Archive(#[from] ArchiveError),

    /// A fixed update panicked.
    #[error("Update panicked: {0}")]
    Panic(String),

    /// `run` on a game that is not stopped.
    #[error("Game is {0:?}, expected Stopped")]
    InvalidState(GameState),

    /// Game thread could not be started.
    #[error("Failed to spawn game thread: {0}")]
    ThreadSpawn(std::io::Error),

    /// Game thread died outside the update boundary.
    #[error("Game thread panicked")]
    ThreadPanicked,
}

#[derive(Debug)]
struct SharedState {
    state: AtomicU8,
    shutdown_requested: AtomicBool,
}

impl SharedState {
    fn get(&self) -> GameState {
        GameState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set(&self, state: GameState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

// =============================================================================
// WORLD
// =============================================================================

/// Mutable simulation state. Scheduled events receive it as their context.
#[derive(Debug)]
pub struct World {
    id: GameId,
    time: GameTime,
    /// Settings.
    pub config: GameConfig,
    /// Read-only prototype data shared across instances.
    pub table: Arc<PrototypeTable>,
    /// Regions and cells.
    pub regions: RegionManager,
    /// Entities.
    pub entities: EntityManager,
    /// Sessions.
    pub connections: PlayerConnectionManager,
    start_region: RegionId,
}

impl World {
    /// Game id.
    pub fn id(&self) -> GameId {
        self.id
    }

    /// Simulation time of the current fixed update.
    pub fn current_time(&self) -> GameTime {
        self.time
    }

    /// Region new avatars enter.
    pub fn start_region(&self) -> RegionId {
        self.start_region
    }

    /// Queue a message for one session.
    pub fn send_message(&mut self, session: SessionId, message: GameMessage) -> bool {
        self.connections.send_message(session, message)
    }

    /// Queue a message for every session.
    pub fn broadcast_message(&mut self, message: GameMessage) {
        self.connections.broadcast_message(message);
    }

    /// Group sessions into a party that replicates through the party channel.
    pub fn set_party(&mut self, members: &[SessionId]) -> Result<usize, ArchiveError> {
        self.connections.set_party(members, &self.entities, &self.table)
    }

    /// Take every entity out of a region, then destroy it.
    pub fn destroy_region(&mut self, region: RegionId) -> bool {
        self.entities.exit_world_all_in_region(region, &mut self.regions);
        self.regions.destroy_region(region)
    }
}

// =============================================================================
// GAME
// =============================================================================

/// A game instance before and while it runs.
pub struct Game {
    world: World,
    scheduler: EventScheduler<World>,
    timestep: FixedTimestep,
    ingress: mpsc::Receiver<IngressEvent>,
    transport: TransportHandle,
    shared: Arc<SharedState>,
    shutdown_reason: Option<GameShutdownReason>,
}

impl Game {
    /// Build a game driven by the wall clock.
    pub fn new(id: GameId, config: GameConfig, table: Arc<PrototypeTable>, store: Arc<dyn PlayerStore>) -> Self {
        Self::with_clock(id, config, table, store, Box::new(MonotonicClock::new()))
    }

    /// Build a game driven by `clock`.
    pub fn with_clock(
        id: GameId,
        config: GameConfig,
        table: Arc<PrototypeTable>,
        store: Arc<dyn PlayerStore>,
        clock: Box<dyn Clock>,
    ) -> Self {
        let timestep = FixedTimestep::new(config.quantum(), clock);
        let (transport, ingress) = TransportHandle::new(config.ingress_capacity, config.egress_capacity);

        let mut regions = RegionManager::new();
        let bounds = config.start_region;
        let start_region = regions.create_region(bounds, config.cell_size);
        let settings = ConnectionSettings {
            proximity_radius: config.proximity_radius,
            player_prototype: config.player_prototype,
            avatar_prototype: config.avatar_prototype,
            start_region,
            spawn_position: (bounds.min + bounds.max) * 0.5,
        };

        let world = World {
            id,
            time: timestep.current_time(),
            config,
            table,
            regions,
            entities: EntityManager::new(EntityFactory::new()),
            connections: PlayerConnectionManager::new(store, settings),
            start_region,
        };

        Self {
            scheduler: EventScheduler::new(timestep.current_time()),
            world,
            timestep,
            ingress,
            transport,
            shared: Arc::new(SharedState {
                state: AtomicU8::new(GameState::Stopped as u8),
                shutdown_requested: AtomicBool::new(false),
            }),
            shutdown_reason: None,
        }
    }

    /// Game id.
    pub fn id(&self) -> GameId {
        self.world.id
    }

    /// Lifecycle state.
    pub fn state(&self) -> GameState {
        self.shared.get()
    }

    /// Why the game stopped, once it has.
    pub fn shutdown_reason(&self) -> Option<GameShutdownReason> {
        self.shutdown_reason
    }

    /// Simulation state.
    pub fn world(&self) -> &World {
        &self.world
    }

    /// Mutable simulation state.
    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    /// Event scheduler.
    pub fn scheduler(&self) -> &EventScheduler<World> {
        &self.scheduler
    }

    /// Mutable event scheduler.
    pub fn scheduler_mut(&mut self) -> &mut EventScheduler<World> {
        &mut self.scheduler
    }

    /// Timestep counters.
    pub fn timestep(&self) -> &FixedTimestep {
        &self.timestep
    }

    /// Sender side of the ingress queue, for the transport.
    pub fn transport(&self) -> TransportHandle {
        self.transport.clone()
    }

    /// Queue a message for one session.
    pub fn send_message(&mut self, session: SessionId, message: GameMessage) -> bool {
        self.world.send_message(session, message)
    }

    /// Queue a message for every session.
    pub fn broadcast_message(&mut self, message: GameMessage) {
        self.world.broadcast_message(message);
    }

    /// Ask the loop to stop after the current iteration.
    pub fn request_shutdown(&self) {
        self.shared.shutdown_requested.store(true, Ordering::SeqCst);
    }

    /// Start the loop on its own thread.
    pub fn run(self) -> Result<GameHandle, GameError> {
        let state = self.state();
        if state != GameState::Stopped {
            return Err(GameError::InvalidState(state));
        }

        let id = self.id();
        let shared = self.shared.clone();
        let transport = self.transport.clone();
        shared.set(GameState::Running);

        let thread = std::thread::Builder::new()
            .name(format!("game-{}", id))
            .spawn(move || self.run_loop())
            .map_err(|e| {
                shared.set(GameState::Stopped);
                GameError::ThreadSpawn(e)
            })?;

        Ok(GameHandle { id, shared, transport, thread })
    }

    fn run_loop(mut self) -> GameShutdownReason {
        info!("Game {} running at {:?} per update", self.id(), self.timestep.quantum());

        while !self.shared.shutdown_requested.load(Ordering::SeqCst) {
            if let Err(err) = self.run_iteration() {
                error!("Game {} crashed: {}", self.id(), err);
                self.write_crash_report(&err);
                self.shutdown(GameShutdownReason::GameInstanceCrash);
                return GameShutdownReason::GameInstanceCrash;
            }
        }

        self.shutdown(GameShutdownReason::ServerShuttingDown);
        GameShutdownReason::ServerShuttingDown
    }

    /// One loop iteration. Faults, including panics, are returned as errors.
    pub fn run_iteration(&mut self) -> Result<FrameReport, GameError> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.iterate())) {
            Ok(result) => result,
            Err(payload) => Err(GameError::Panic(panic_message(payload.as_ref()))),
        }
    }

    fn iterate(&mut self) -> Result<FrameReport, GameError> {
        self.process_ingress();

        if !self.timestep.is_update_due() {
            std::thread::sleep(self.world.config.idle_sleep());
            return Ok(FrameReport::default());
        }

        let Self { timestep, scheduler, world, .. } = self;
        let quantum = timestep.quantum();
        let report = timestep.advance(|now| fixed_update(world, scheduler, now, quantum))?;

        self.world.connections.send_all_pending_messages();
        for session in self.world.connections.take_closed_sessions() {
            let World { connections, entities, table, .. } = &mut self.world;
            connections.detach(session, entities, table);
        }
        Ok(report)
    }

    fn process_ingress(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let event = match self.ingress.try_recv() {
                Ok(event) => event,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            };
            handled += 1;

            let World { connections, entities, regions, table, .. } = &mut self.world;
            match event {
                IngressEvent::Connected { session, account_key, egress } => {
                    if !connections.attach(session, &account_key, egress, entities, table) {
                        warn!("Session {} could not attach", session);
                    }
                }
                IngressEvent::Disconnected { session } => {
                    connections.detach(session, entities, table);
                }
                IngressEvent::Message { session, payload } => {
                    connections.handle_message(session, &payload, entities, regions);
                }
            }
        }
        handled
    }

    /// Run the shutdown sequence. Returns false if it already ran.
    pub fn shutdown(&mut self, reason: GameShutdownReason) -> bool {
        if matches!(self.state(), GameState::ShuttingDown | GameState::ShutDown) {
            return false;
        }
        self.shared.set(GameState::ShuttingDown);
        self.shared.shutdown_requested.store(true, Ordering::SeqCst);
        info!("Game {} shutting down ({:?})", self.id(), reason);

        self.scheduler.cancel_all_events();
        self.world.connections.send_all_pending_messages();

        let World { connections, entities, regions, table, .. } = &mut self.world;
        let sessions = connections.disconnect_all(reason.message(), entities, table);

        // Pending creations join the live set first so they are released too
        entities.process_deferred_lists(regions);
        let remaining: Vec<_> = entities.iter().map(|e| e.id()).collect();
        for id in remaining {
            entities.destroy_entity(id);
        }
        let report = entities.process_deferred_lists(regions);
        entities.take_created();
        entities.take_destroyed();
        regions.destroy_all();

        debug!("Game {} released {} session(s), {} entities", self.world.id, sessions, report.destroyed.len());
        self.shutdown_reason = Some(reason);
        self.shared.set(GameState::ShutDown);
        info!("Game {} shut down", self.world.id);
        true
    }

    fn write_crash_report(&self, err: &GameError) -> Option<PathBuf> {
        let report = CrashReport {
            game_id: self.id(),
            timestamp: Local::now(),
            error: err.to_string(),
            regions: self
                .world
                .regions
                .iter()
                .map(|r| RegionSummary { id: r.id(), entity_count: r.entities().count() })
                .collect(),
            scheduled_events: self.scheduler.scheduled_event_counts(),
        };
        match report.write_to(&self.world.config.crash_report_dir) {
            Ok(path) => {
                error!("Crash report written to {}", path.display());
                Some(path)
            }
            Err(e) => {
                error!("Failed to write crash report: {}", e);
                None
            }
        }
    }
}

impl std::fmt::Debug for Game {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Game")
            .field("id", &self.world.id)
            .field("state", &self.state())
            .field("timestep", &self.timestep)
            .field("scheduled", &self.scheduler.len())
            .finish()
    }
}

fn fixed_update(
    world: &mut World,
    scheduler: &mut EventScheduler<World>,
    now: GameTime,
    quantum: std::time::Duration,
) -> Result<(), GameError> {
    world.time = now;
    scheduler.trigger_events(now, world);
    world.entities.locomote(quantum, &mut world.regions);
    world.entities.process_deferred_lists(&mut world.regions);
    world.connections.replicate(&mut world.entities, &world.regions, &world.table)?;
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

// =============================================================================
// HANDLE
// =============================================================================

/// Control handle of a running game.
#[derive(Debug)]
pub struct GameHandle {
    id: GameId,
    shared: Arc<SharedState>,
    transport: TransportHandle,
    thread: JoinHandle<GameShutdownReason>,
}

impl GameHandle {
    /// Game id.
    pub fn id(&self) -> GameId {
        self.id
    }

    /// Lifecycle state.
    pub fn state(&self) -> GameState {
        self.shared.get()
    }

    /// Sender side of the ingress queue.
    pub fn transport(&self) -> &TransportHandle {
        &self.transport
    }

    /// Ask the loop to stop. Repeated requests are no-ops.
    pub fn request_shutdown(&self) {
        if !self.shared.shutdown_requested.swap(true, Ordering::SeqCst) {
            info!("Shutdown requested for game {}", self.id);
        }
    }

    /// True once the game thread exited.
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the game thread.
    pub fn join(self) -> Result<GameShutdownReason, GameError> {
        self.thread.join().map_err(|_| GameError::ThreadPanicked)
    }
}
