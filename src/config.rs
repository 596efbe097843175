//! Configuration
//!
//! Server and game settings, loadable from a JSON file. Every field has a
//! default, so a config file only needs the values it overrides.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Serialize, Deserialize};

use crate::core::ids::PrototypeId;
use crate::core::time::quantum_for_rate;
use crate::core::vec3::Vector3;
use crate::game::prototype::protos;
use crate::game::region::Bounds;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid JSON for the config schema.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range.
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Settings of one game instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    /// Fixed updates per second.
    pub frame_rate: u32,
    /// Sleep between iterations when no update is due, in milliseconds.
    pub idle_sleep_ms: u64,
    /// AOI proximity radius.
    pub proximity_radius: f32,
    /// Region cell edge length.
    pub cell_size: f32,
    /// Ingress queue capacity (transport to game).
    pub ingress_capacity: usize,
    /// Per-session egress queue capacity (game to transport).
    pub egress_capacity: usize,
    /// Directory for crash reports.
    pub crash_report_dir: PathBuf,
    /// Prototype of new player entities.
    pub player_prototype: PrototypeId,
    /// Prototype of new avatars.
    pub avatar_prototype: PrototypeId,
    /// Bounds of the region new avatars start in.
    pub start_region: Bounds,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            frame_rate: 20,
            idle_sleep_ms: 1,
            proximity_radius: 50.0,
            cell_size: 25.0,
            ingress_capacity: 1024,
            egress_capacity: 256,
            crash_report_dir: PathBuf::from("crash_reports"),
            player_prototype: protos::PLAYER,
            avatar_prototype: protos::AVATAR,
            start_region: Bounds::new(Vector3::ZERO, Vector3::new(500.0, 500.0, 100.0)),
        }
    }
}

impl GameConfig {
    /// Length of one fixed update.
    pub fn quantum(&self) -> Duration {
        quantum_for_rate(self.frame_rate)
    }

    /// Sleep between idle iterations.
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    /// Reject values the game cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_rate == 0 || self.frame_rate > 1000 {
            return Err(ConfigError::Invalid(format!("frame_rate {} not in 1..=1000", self.frame_rate)));
        }
        if self.cell_size.is_nan() || self.cell_size <= 0.0 {
            return Err(ConfigError::Invalid(format!("cell_size {} must be positive", self.cell_size)));
        }
        if self.proximity_radius.is_nan() || self.proximity_radius < 0.0 {
            return Err(ConfigError::Invalid(format!("proximity_radius {} must not be negative", self.proximity_radius)));
        }
        if self.ingress_capacity == 0 || self.egress_capacity == 0 {
            return Err(ConfigError::Invalid("queue capacities must be positive".to_string()));
        }
        let b = self.start_region;
        if b.max.x <= b.min.x || b.max.y <= b.min.y {
            return Err(ConfigError::Invalid("start_region is empty".to_string()));
        }
        Ok(())
    }
}

/// Front end settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Seconds a new connection has to send its account key.
    pub login_timeout_secs: u64,
    /// Game instance settings.
    pub game: GameConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
            max_connections: 1000,
            login_timeout_secs: 10,
            game: GameConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Login deadline for new connections.
    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    /// Parse and validate JSON.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.game.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}
