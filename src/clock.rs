// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Cycle-counter abstraction.
//!
//! The original implementation times everything in CPU cycles
//! (`get_cycles()`) and converts usec-based sysctls to cycles once via
//! `tuning_changed()`. Rust has no portable rdtsc, so `cycles()` is backed
//! by a monotonic nanosecond counter instead; call sites that need a
//! "cycles per second" rate use [`Clock::frequency_hz`] exactly the way
//! the original uses `cpu_khz`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Source of monotonically increasing "cycle" timestamps.
///
/// Implementations must be cheap enough to call on every packet arrival.
pub trait Clock: Send + Sync {
    /// Current timestamp, in this clock's units. Must be monotonically
    /// non-decreasing for a single instance.
    fn cycles(&self) -> u64;

    /// Units per second, for converting usec knobs to cycle counts.
    fn frequency_hz(&self) -> u64;
}

/// Wall-clock implementation backed by [`std::time::Instant`].
///
/// One cycle equals one nanosecond, so `frequency_hz` is always 1e9.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn cycles(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn frequency_hz(&self) -> u64 {
        1_000_000_000
    }
}

/// Deterministic clock for tests: cycles only advance when told to.
pub struct FakeClock {
    now: AtomicU64,
    freq_hz: u64,
}

impl FakeClock {
    pub fn new(freq_hz: u64) -> Self {
        Self {
            now: AtomicU64::new(0),
            freq_hz,
        }
    }

    pub fn advance(&self, cycles: u64) {
        self.now.fetch_add(cycles, Ordering::Relaxed);
    }

    pub fn set(&self, cycles: u64) {
        self.now.store(cycles, Ordering::Relaxed);
    }
}

impl Clock for FakeClock {
    fn cycles(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }

    fn frequency_hz(&self) -> u64 {
        self.freq_hz
    }
}
