//! Simulation Time
//!
//! Simulation time is an absolute [`Duration`] since the game started.
//! Real time is read from a [`Clock`] and quantized down to whole
//! quantums, so simulation time always lands on a quantum boundary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Absolute simulation time.
pub type GameTime = Duration;

/// Source of real elapsed time.
pub trait Clock: Send {
    /// Elapsed time since the clock was created.
    fn now(&self) -> Duration;
}

/// Wall clock backed by [`Instant`].
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    started: Instant,
}

impl MonotonicClock {
    /// Start a new clock at zero.
    pub fn new() -> Self {
        Self { started: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Manually advanced clock. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.micros.fetch_add(by.as_micros() as u64, Ordering::SeqCst);
    }

    /// Jump the clock to an absolute time.
    pub fn set(&self, to: Duration) {
        self.micros.store(to.as_micros() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_micros(self.micros.load(Ordering::SeqCst))
    }
}

/// Time value that only moves in whole quantums.
#[derive(Debug, Clone, Copy)]
pub struct FixedQuantumTime {
    quantum: Duration,
    time: Duration,
}

impl FixedQuantumTime {
    /// Create at `start`, rounded down to the quantum.
    pub fn new(quantum: Duration, start: Duration) -> Self {
        let mut t = Self { quantum, time: Duration::ZERO };
        t.update_to(start);
        t
    }

    /// Quantum size.
    pub fn quantum(&self) -> Duration {
        self.quantum
    }

    /// Current quantized value.
    pub fn get(&self) -> Duration {
        self.time
    }

    /// Set to `now`, rounded down to a whole number of quantums.
    pub fn update_to(&mut self, now: Duration) {
        self.time = floor_to_quantum(now, self.quantum);
    }
}

/// Round a duration down to a whole number of quantums.
pub fn floor_to_quantum(time: Duration, quantum: Duration) -> Duration {
    let q = quantum.as_nanos();
    if q == 0 {
        return time;
    }
    let n = time.as_nanos() / q;
    Duration::from_nanos((n * q) as u64)
}

/// Number of whole quantums in a duration.
pub fn num_quantums(time: Duration, quantum: Duration) -> u64 {
    let q = quantum.as_nanos();
    if q == 0 {
        return 0;
    }
    (time.as_nanos() / q) as u64
}

/// Quantum for a target update rate.
pub fn quantum_for_rate(updates_per_second: u32) -> Duration {
    Duration::from_micros(1_000_000 / updates_per_second.max(1) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_to_quantum() {
        let q = Duration::from_millis(50);
        assert_eq!(floor_to_quantum(Duration::from_millis(149), q), Duration::from_millis(100));
        assert_eq!(floor_to_quantum(Duration::from_millis(150), q), Duration::from_millis(150));
        assert_eq!(floor_to_quantum(Duration::from_millis(10), q), Duration::ZERO);
    }

    #[test]
    fn test_fixed_quantum_time() {
        let mut t = FixedQuantumTime::new(Duration::from_millis(50), Duration::from_millis(75));
        assert_eq!(t.get(), Duration::from_millis(50));
        t.update_to(Duration::from_millis(249));
        assert_eq!(t.get(), Duration::from_millis(200));
    }

    #[test]
    fn test_manual_clock_shared() {
        let clock = ManualClock::new();
        let other = clock.clone();
        clock.advance(Duration::from_millis(30));
        assert_eq!(other.now(), Duration::from_millis(30));
        other.set(Duration::from_secs(2));
        assert_eq!(clock.now(), Duration::from_secs(2));
    }

    #[test]
    fn test_quantum_for_rate() {
        assert_eq!(quantum_for_rate(20), Duration::from_millis(50));
        assert_eq!(num_quantums(Duration::from_millis(1000), quantum_for_rate(20)), 20);
    }
}
