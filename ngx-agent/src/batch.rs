//! Time-windowed accumulation of parsed records.
//!
//! Batches are bounded by wall-clock time since the previous flush, not by record count. The
//! buffer has no hard cap: under sustained bursts it grows until the next window closes.

use crate::record::AccessRecord;
use std::time::Duration;
use tokio::time::Instant;

const INITIAL_CAPACITY: usize = 100;

#[derive(Debug)]
pub struct BatchAccumulator {
    buffer: Vec<AccessRecord>,
    window: Duration,
    flush_on_first_tick: bool,
    last_flush_at: Instant,
    flushed_once: bool,
}

impl BatchAccumulator {
    /// Starts an empty accumulator whose first window opens at `now`.
    ///
    /// With `flush_on_first_tick` the first flush check is eligible immediately instead of
    /// waiting a full window.
    pub fn new(window: Duration, flush_on_first_tick: bool, now: Instant) -> Self {
        Self {
            buffer: Vec::with_capacity(INITIAL_CAPACITY),
            window,
            flush_on_first_tick,
            last_flush_at: now,
            flushed_once: false,
        }
    }

    pub fn offer(&mut self, record: AccessRecord) {
        self.buffer.push(record);
    }

    pub fn should_flush(&self, now: Instant) -> bool {
        if self.flush_on_first_tick && !self.flushed_once {
            return true;
        }
        now.saturating_duration_since(self.last_flush_at) >= self.window
    }

    /// Instant at which the current window closes.
    pub fn deadline(&self) -> Instant {
        if self.flush_on_first_tick && !self.flushed_once {
            self.last_flush_at
        } else {
            self.last_flush_at + self.window
        }
    }

    /// Hands over the buffered records and opens a new window at `now`.
    pub fn take(&mut self, now: Instant) -> Vec<AccessRecord> {
        self.last_flush_at = now;
        self.flushed_once = true;
        std::mem::replace(&mut self.buffer, Vec::with_capacity(INITIAL_CAPACITY))
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
