//! Time utilities.
//!
//! In-process lease deadlines are expressed as [`Tick`]s: milliseconds elapsed
//! since a [`TickClock`] was created. The clock reads `tokio::time::Instant`,
//! so tests running with a paused runtime control lease expiry
//! deterministically. Deadlines shared between processes use wall-clock
//! milliseconds ([`unix_millis`]).

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// A point in time relative to a clock epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tick {
    /// Milliseconds since the clock epoch.
    pub ms: u64,
}

impl Tick {
    /// Create a new tick with the given millisecond value.
    pub const fn new(ms: u64) -> Self {
        Self { ms }
    }

    /// Create a tick representing zero (epoch start).
    pub const fn zero() -> Self {
        Self { ms: 0 }
    }

    /// Add milliseconds to this tick.
    pub const fn add_ms(self, ms: u64) -> Self {
        Self {
            ms: self.ms.saturating_add(ms),
        }
    }

    /// Check if this tick is at or after the given deadline.
    pub const fn is_at_or_after(self, deadline: Tick) -> bool {
        self.ms >= deadline.ms
    }

    /// Milliseconds until a deadline.
    ///
    /// Returns 0 if the deadline has already passed.
    pub fn ms_until(self, deadline: Tick) -> u64 {
        deadline.ms.saturating_sub(self.ms)
    }
}

impl std::fmt::Display for Tick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tick({}ms)", self.ms)
    }
}

/// Monotonic clock producing [`Tick`]s.
#[derive(Debug, Clone, Copy)]
pub struct TickClock {
    epoch: Instant,
}

impl TickClock {
    /// Start a clock at the current instant.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Current tick.
    pub fn now(&self) -> Tick {
        Tick::new(self.epoch.elapsed().as_millis() as u64)
    }
}

impl Default for TickClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Milliseconds to a `Duration`.
pub fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

/// Wall-clock time in milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Wall-clock time in nanoseconds since the Unix epoch, for record timestamps.
pub fn unix_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}
