//! Fixed Timestep
//!
//! Drives simulation time in whole quantums behind a real clock.
//!
//! ```text
//!   real     |----|----|----|----|--.    (quantized down)
//!   current  |----|----|
//!                      ^ catch-up: one fixed update per quantum, while the
//!                        burst stays within one quantum of wall-clock budget
//!   leftover lead after the burst is skipped: current = real
//! ```
//!
//! Simulation time never exceeds real time after an advance, and is
//! always a whole number of quantums.

use std::time::Duration;

use tracing::{debug, trace};

use crate::core::time::{Clock, FixedQuantumTime, GameTime};

/// What one [`FixedTimestep::advance`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameReport {
    /// Fixed updates performed.
    pub updates: u32,
    /// Simulation time skipped because the burst fell behind.
    pub skipped: Duration,
}

/// Fixed-quantum simulation clock with catch-up and time-skip.
pub struct FixedTimestep {
    clock: Box<dyn Clock>,
    real: FixedQuantumTime,
    current: GameTime,
    frame_count: u64,
    last_update_cost: Duration,
    catch_up_frames: u64,
    skipped_time: Duration,
}

impl FixedTimestep {
    /// Start at the clock's current time, quantized.
    pub fn new(quantum: Duration, clock: Box<dyn Clock>) -> Self {
        let real = FixedQuantumTime::new(quantum, clock.now());
        Self {
            clock,
            current: real.get(),
            real,
            frame_count: 0,
            last_update_cost: Duration::ZERO,
            catch_up_frames: 0,
            skipped_time: Duration::ZERO,
        }
    }

    /// Quantum size.
    pub fn quantum(&self) -> Duration {
        self.real.quantum()
    }

    /// Current simulation time.
    pub fn current_time(&self) -> GameTime {
        self.current
    }

    /// Last observed real time, quantized.
    pub fn real_time(&self) -> GameTime {
        self.real.get()
    }

    /// Total fixed updates performed.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Wall-clock cost of the most recent fixed update.
    pub fn last_update_cost(&self) -> Duration {
        self.last_update_cost
    }

    /// Fixed updates beyond the first in each burst.
    pub fn catch_up_frames(&self) -> u64 {
        self.catch_up_frames
    }

    /// Total simulation time skipped.
    pub fn skipped_time(&self) -> Duration {
        self.skipped_time
    }

    /// True when real time leads simulation time by at least one quantum.
    pub fn is_update_due(&mut self) -> bool {
        self.real.update_to(self.clock.now());
        self.current + self.quantum() <= self.real.get()
    }

    /// Run every due fixed update, then skip whatever lead remains.
    ///
    /// `update` receives the new simulation time. An error stops the burst
    /// immediately and leaves simulation time at the failed update.
    pub fn advance<E>(&mut self, mut update: impl FnMut(GameTime) -> Result<(), E>) -> Result<FrameReport, E> {
        let quantum = self.quantum();
        self.real.update_to(self.clock.now());
        let burst_start = self.clock.now();
        let mut report = FrameReport::default();

        while self.current + quantum <= self.real.get() {
            self.current += quantum;

            let started = self.clock.now();
            update(self.current)?;
            let cost = self.clock.now().saturating_sub(started);

            self.last_update_cost = cost;
            self.frame_count += 1;
            report.updates += 1;
            if cost > quantum {
                trace!("Fixed update took {:?} (quantum {:?})", cost, quantum);
            }

            if self.clock.now().saturating_sub(burst_start) > quantum {
                break;
            }
        }

        if report.updates > 1 {
            self.catch_up_frames += u64::from(report.updates - 1);
            debug!("Caught up {} frame(s)", report.updates - 1);
        }

        if self.real.get() > self.current {
            report.skipped = self.real.get() - self.current;
            self.skipped_time += report.skipped;
            self.current = self.real.get();
            debug!("Skipped {:?} of simulation time", report.skipped);
        }

        Ok(report)
    }
}

impl std::fmt::Debug for FixedTimestep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedTimestep")
            .field("quantum", &self.quantum())
            .field("current", &self.current)
            .field("real", &self.real.get())
            .field("frame_count", &self.frame_count)
            .finish()
    }
}
