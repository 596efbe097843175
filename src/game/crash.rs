//! Crash Reports
//!
//! Diagnostic snapshot written when a fixed update fails.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::core::ids::{GameId, RegionId};

/// One active region at crash time.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionSummary {
    /// Region.
    pub id: RegionId,
    /// Entities placed in it.
    pub entity_count: usize,
}

/// Snapshot of a crashed game instance.
#[derive(Debug, Clone)]
pub struct CrashReport {
    /// Crashed game.
    pub game_id: GameId,
    /// Local wall-clock time of the crash.
    pub timestamp: DateTime<Local>,
    /// Error detail.
    pub error: String,
    /// Active regions.
    pub regions: Vec<RegionSummary>,
    /// Pending scheduled events per type.
    pub scheduled_events: BTreeMap<&'static str, usize>,
}

impl CrashReport {
    /// File name for this report.
    pub fn file_name(&self) -> String {
        format!("GameInstanceCrash_{}.txt", self.timestamp.format("%Y-%m-%d_%H.%M.%S%.3f"))
    }

    /// Report text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Version: {}", crate::VERSION);
        let _ = writeln!(out, "Time: {}", self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f %z"));
        let _ = writeln!(out, "Game: {}", self.game_id);
        let _ = writeln!(out);
        let _ = writeln!(out, "Error:");
        let _ = writeln!(out, "{}", self.error);
        let _ = writeln!(out);

        let _ = writeln!(out, "Active Regions ({}):", self.regions.len());
        for region in &self.regions {
            let _ = writeln!(out, "  {} ({} entities)", region.id, region.entity_count);
        }
        let _ = writeln!(out);

        let total: usize = self.scheduled_events.values().sum();
        let _ = writeln!(out, "Scheduled Events ({}):", total);
        for (name, count) in &self.scheduled_events {
            let _ = writeln!(out, "  {}: {}", name, count);
        }
        out
    }

    /// Write the report into `dir`, creating it if needed.
    pub fn write_to(&self, dir: &Path) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());
        std::fs::write(&path, self.render())?;
        Ok(path)
    }
}
