//! Per-device timing counters.
//!
//! Accumulated wall-clock time spent in the three phases of a transfer, in
//! microseconds. Exposed read-only to the surrounding attribute layer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct TransferTimers {
    pub buffer_setup: AtomicU64,
    pub buffer_release: AtomicU64,
    pub pump_run: AtomicU64,
}

impl TransferTimers {
    pub fn add_setup(&self, elapsed: Duration) {
        self.buffer_setup
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_release(&self, elapsed: Duration) {
        self.buffer_release
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_run(&self, elapsed: Duration) {
        self.pump_run
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.buffer_setup.store(0, Ordering::Relaxed);
        self.buffer_release.store(0, Ordering::Relaxed);
        self.pump_run.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TimingSnapshot {
        TimingSnapshot {
            usec_buffer_setup: self.buffer_setup.load(Ordering::Relaxed),
            usec_buffer_release: self.buffer_release.load(Ordering::Relaxed),
            usec_pump_run: self.pump_run.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the timing counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingSnapshot {
    pub usec_buffer_setup: u64,
    pub usec_buffer_release: u64,
    pub usec_pump_run: u64,
}
