//! Per-session readout counters.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Snapshot of one readout session.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReadoutStats {
    /// Bytes received on the data socket
    pub bytes_read: u64,
    /// Chunks pushed onto the queue, sentinel excluded
    pub chunks_produced: u64,
    /// Samples handed to the handler
    pub samples_delivered: u64,
    /// Handler errors and panics
    pub callback_faults: u64,
    /// Time since the session started (frozen once it stops)
    pub elapsed: Duration,
}

impl ReadoutStats {
    /// Average data-socket throughput over the session.
    pub fn bytes_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes_read as f64 / secs
        } else {
            0.0
        }
    }
}

/// Shared counters updated by the reader and worker.
#[derive(Debug, Default)]
pub struct ReadoutCounters {
    bytes_read: AtomicU64,
    chunks_produced: AtomicU64,
    samples_delivered: AtomicU64,
    callback_faults: AtomicU64,
    started: Mutex<Option<Instant>>,
    stopped: Mutex<Option<Instant>>,
}

impl ReadoutCounters {
    /// Zero everything and start the session clock.
    pub fn reset(&self) {
        self.bytes_read.store(0, Ordering::SeqCst);
        self.chunks_produced.store(0, Ordering::SeqCst);
        self.samples_delivered.store(0, Ordering::SeqCst);
        self.callback_faults.store(0, Ordering::SeqCst);
        *self.started.lock() = Some(Instant::now());
        *self.stopped.lock() = None;
    }

    /// Freeze the session clock.
    pub fn mark_stopped(&self) {
        let mut stopped = self.stopped.lock();
        if stopped.is_none() {
            *stopped = Some(Instant::now());
        }
    }

    pub(crate) fn record_read(&self, bytes: usize) {
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
        self.chunks_produced.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivery(&self, samples: usize) {
        self.samples_delivered
            .fetch_add(samples as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_fault(&self) {
        self.callback_faults.fetch_add(1, Ordering::SeqCst);
    }

    /// Current values.
    pub fn snapshot(&self) -> ReadoutStats {
        let elapsed = match (*self.started.lock(), *self.stopped.lock()) {
            (Some(start), Some(stop)) => stop.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        };

        ReadoutStats {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            chunks_produced: self.chunks_produced.load(Ordering::Relaxed),
            samples_delivered: self.samples_delivered.load(Ordering::Relaxed),
            callback_faults: self.callback_faults.load(Ordering::SeqCst),
            elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_clears_counters() {
        let counters = ReadoutCounters::default();
        counters.record_read(100);
        counters.record_delivery(50);
        counters.record_fault();

        let stats = counters.snapshot();
        assert_eq!(stats.bytes_read, 100);
        assert_eq!(stats.chunks_produced, 1);
        assert_eq!(stats.samples_delivered, 50);
        assert_eq!(stats.callback_faults, 1);

        counters.reset();
        let stats = counters.snapshot();
        assert_eq!(stats.bytes_read, 0);
        assert_eq!(stats.callback_faults, 0);
    }

    #[test]
    fn test_elapsed_freezes_on_stop() {
        let counters = ReadoutCounters::default();
        assert_eq!(counters.snapshot().elapsed, Duration::ZERO);

        counters.reset();
        std::thread::sleep(Duration::from_millis(5));
        counters.mark_stopped();
        let first = counters.snapshot().elapsed;
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(counters.snapshot().elapsed, first);
        assert!(first >= Duration::from_millis(5));
    }

    #[test]
    fn test_throughput() {
        let stats = ReadoutStats {
            bytes_read: 2000,
            elapsed: Duration::from_secs(2),
            ..Default::default()
        };
        assert!((stats.bytes_per_second() - 1000.0).abs() < f64::EPSILON);
        assert_eq!(ReadoutStats::default().bytes_per_second(), 0.0);
    }
}
