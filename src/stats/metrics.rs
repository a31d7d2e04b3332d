use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Lower bound for the number of loop iterations when calculating the average loop time, so
///  that a loop that (almost) did not run does not cause a division by zero
const MIN_LOOP_DIVISOR: f64 = 0.001;

/// Counters of the inbound direction. They are updated concurrently without locking; only the
///  snapshot synchronizes.
pub struct Metrics {
    bytes_in: AtomicU64,
    frames_in: AtomicU64,
    checksum_failures: AtomicU64,
    loop_iterations: AtomicU64,
    last_snapshot: Mutex<Instant>,
}

/// Rates since the previous snapshot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    pub elapsed: Duration,
    pub bytes_in: u64,
    pub frames_in: u64,
    pub checksum_failures: u64,
    pub loop_iterations: u64,

    pub bytes_per_sec: f64,
    /// average duration of one inbound loop iteration, in seconds
    pub avg_loop_time_secs: f64,
    pub checksum_failures_per_sec: f64,
    pub frames_per_sec: f64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Metrics {
        Metrics {
            bytes_in: AtomicU64::new(0),
            frames_in: AtomicU64::new(0),
            checksum_failures: AtomicU64::new(0),
            loop_iterations: AtomicU64::new(0),
            last_snapshot: Mutex::new(Instant::now()),
        }
    }

    pub fn on_frame(&self, payload_len: u64) {
        self.bytes_in.fetch_add(payload_len, Ordering::Relaxed);
        self.frames_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_checksum_failure(&self) {
        self.checksum_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_loop_iteration(&self) {
        self.loop_iterations.fetch_add(1, Ordering::Relaxed);
    }

    /// Calculates rates for the time since the previous snapshot, and resets all counters and
    ///  the clock.
    ///
    /// NB: This is destructive - two snapshots in immediate succession do *not* return the same
    ///      values, the second one reflects only what happened after the first.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut last_snapshot = self.last_snapshot.lock()
            .unwrap_or_else(PoisonError::into_inner);

        let now = Instant::now();
        let elapsed = now.saturating_duration_since(*last_snapshot);
        *last_snapshot = now;

        let bytes_in = self.bytes_in.swap(0, Ordering::Relaxed);
        let frames_in = self.frames_in.swap(0, Ordering::Relaxed);
        let checksum_failures = self.checksum_failures.swap(0, Ordering::Relaxed);
        let loop_iterations = self.loop_iterations.swap(0, Ordering::Relaxed);

        let dt = elapsed.as_secs_f64().max(f64::MIN_POSITIVE);

        MetricsSnapshot {
            elapsed,
            bytes_in,
            frames_in,
            checksum_failures,
            loop_iterations,
            bytes_per_sec: bytes_in as f64 / dt,
            avg_loop_time_secs: elapsed.as_secs_f64() / (loop_iterations as f64).max(MIN_LOOP_DIVISOR),
            checksum_failures_per_sec: checksum_failures as f64 / dt,
            frames_per_sec: frames_in as f64 / dt,
        }
    }
}
