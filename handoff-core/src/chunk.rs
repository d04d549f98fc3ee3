//! Chunk sizing and progress throttling for the data pipeline.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::{Settings, MIB};
use crate::wire::MAX_CHUNK_LEN;

/// Consecutive successful chunks before the size doubles.
pub const GROW_AFTER: u32 = 2;
/// Shrink factor applied after a failed send, in percent.
pub const SHRINK_PERCENT: u64 = 80;
/// Minimum interval between progress updates.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

/// Adaptive chunk size: grows on a run of successes, shrinks on failure.
#[derive(Debug, Clone)]
pub struct ChunkSizer {
    current: u64,
    min: u64,
    max: u64,
    streak: u32,
}

impl ChunkSizer {
    pub fn new(initial: u64, min: u64, max: u64) -> Self {
        let min = min.max(1);
        let max = max.max(min);
        Self {
            current: initial.clamp(min, max),
            min,
            max,
            streak: 0,
        }
    }

    /// Bounds from `settings`, capped so a chunk always fits in one wire frame.
    pub fn from_settings(settings: &Settings) -> Self {
        let max = settings.max_chunk_size.min(MAX_CHUNK_LEN);
        Self::new(
            settings.initial_chunk_size,
            settings.min_chunk_size.min(max),
            max,
        )
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn on_success(&mut self) {
        self.streak += 1;
        if self.streak >= GROW_AFTER {
            self.streak = 0;
            self.current = self.current.saturating_mul(2).min(self.max);
        }
    }

    pub fn on_failure(&mut self) {
        self.streak = 0;
        self.current = (self.current * SHRINK_PERCENT / 100).max(self.min);
    }
}

/// Coalesces per-chunk progress into updates at a bounded rate.
#[derive(Debug)]
pub struct ProgressThrottle {
    step: u64,
    last_bytes: u64,
    last_at: Option<Instant>,
}

impl ProgressThrottle {
    /// Step is max(1 MiB, 1% of `total`).
    pub fn new(total: u64) -> Self {
        Self {
            step: MIB.max(total / 100),
            last_bytes: 0,
            last_at: None,
        }
    }

    /// Whether `bytes` should be reported now. `done` always reports.
    pub fn should_emit(&mut self, bytes: u64, done: bool) -> bool {
        let now = Instant::now();
        let due = done
            || self.last_at.is_none()
            || bytes.saturating_sub(self.last_bytes) >= self.step
            || self
                .last_at
                .is_some_and(|at| now.duration_since(at) >= PROGRESS_INTERVAL);
        if due && bytes >= self.last_bytes {
            self.last_bytes = bytes;
            self.last_at = Some(now);
            return true;
        }
        false
    }
}
