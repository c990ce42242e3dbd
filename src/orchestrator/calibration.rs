//! Per-thread iteration sizing.
//!
//! Rounds are sized so that a full fetch, search and submit cycle lands near
//! the target duration, which keeps template polling on a steady cadence.

use std::time::Duration;
use tracing::{debug, info};

/// Upper bound on work handed to a single thread per round.
pub const MAX_ITERATIONS_PER_THREAD: u64 = 1 << 40;

/// Lower bound for the benchmark seed.
pub const MIN_SEED_ITERATIONS: u64 = 1_000;

/// Starting point when auto-calibrating without a benchmark.
pub const DEFAULT_INITIAL_ITERATIONS: u64 = 100_000;

const MIN_FACTOR: f64 = 0.5;
const MAX_FACTOR: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationMode {
    /// Operator-supplied count, never adjusted
    Fixed(u64),
    Auto,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationState {
    pub iterations_per_thread: u64,
    pub last_round_duration: Option<Duration>,
    pub target_duration: Duration,
}

#[derive(Debug, Clone)]
pub struct CalibrationController {
    mode: IterationMode,
    state: CalibrationState,
}

impl CalibrationController {
    pub fn new(mode: IterationMode, target_duration: Duration) -> Self {
        let iterations_per_thread = match mode {
            IterationMode::Fixed(iterations) => iterations,
            IterationMode::Auto => DEFAULT_INITIAL_ITERATIONS,
        };
        Self {
            mode,
            state: CalibrationState {
                iterations_per_thread,
                last_round_duration: None,
                target_duration,
            },
        }
    }

    pub fn iterations_per_thread(&self) -> u64 {
        self.state.iterations_per_thread
    }

    pub fn state(&self) -> &CalibrationState {
        &self.state
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self.mode, IterationMode::Fixed(_))
    }

    /// Record a full round and resize the next one.
    pub fn observe(&mut self, elapsed: Duration) -> u64 {
        self.state.last_round_duration = Some(elapsed);
        if self.is_fixed() {
            return self.state.iterations_per_thread;
        }

        let factor = if elapsed.is_zero() {
            MAX_FACTOR
        } else {
            (self.state.target_duration.as_secs_f64() / elapsed.as_secs_f64())
                .clamp(MIN_FACTOR, MAX_FACTOR)
        };

        let previous = self.state.iterations_per_thread;
        let next = (previous as f64 * factor).round() as u64;
        self.state.iterations_per_thread = next.clamp(1, MAX_ITERATIONS_PER_THREAD);

        debug!(
            "Round took {:.2}s (target {:.2}s), iterations {} -> {}",
            elapsed.as_secs_f64(),
            self.state.target_duration.as_secs_f64(),
            previous,
            self.state.iterations_per_thread
        );
        self.state.iterations_per_thread
    }

    /// Start from a measured per-thread hash rate instead of the default.
    pub fn seed_from_hashrate(&mut self, per_thread_hashrate: f64) -> u64 {
        if self.is_fixed() || !per_thread_hashrate.is_finite() || per_thread_hashrate <= 0.0 {
            return self.state.iterations_per_thread;
        }

        let seeded = (per_thread_hashrate * self.state.target_duration.as_secs_f64()).round() as u64;
        self.state.iterations_per_thread = seeded.clamp(MIN_SEED_ITERATIONS, MAX_ITERATIONS_PER_THREAD);

        info!(
            "Calibrated to {} iterations per thread ({:.2} H/s per thread)",
            self.state.iterations_per_thread, per_thread_hashrate
        );
        self.state.iterations_per_thread
    }
}
