//! Throughput and ETA tracking for streaming sessions.
//!
//! The tracker keeps a small window of instantaneous throughput samples and
//! averages them, which smooths out scheduler jitter without letting an
//! early burst dominate the estimate for the rest of a long stream.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Number of throughput samples retained in the rolling window.
pub const THROUGHPUT_WINDOW: usize = 5;

/// Samples above this rate are treated as clock artifacts and dropped.
pub const MAX_SANE_THROUGHPUT: f64 = 10.0 * 1024.0 * 1024.0 * 1024.0;

/// Point-in-time view of a session's progress.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub bytes_processed: u64,
    pub chunks_processed: u64,
    /// Rolling average over the retained samples, 0.0 until a sample lands.
    pub throughput_bytes_per_sec: f64,
    /// Seconds until completion, when the total is known and throughput is
    /// positive.
    pub eta_seconds: Option<f64>,
    /// Completion percentage in `0.0..=100.0`, when the total is known.
    pub percent: Option<f64>,
    pub elapsed: Duration,
}

/// Accumulates byte/chunk counts and derives throughput metrics.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    bytes_processed: u64,
    chunks_processed: u64,
    start: Instant,
    last_update: Instant,
    total_bytes: Option<u64>,
    recent_throughputs: VecDeque<f64>,
}

impl ProgressTracker {
    #[must_use]
    pub fn new(total_bytes: Option<u64>) -> Self {
        let now = Instant::now();
        Self {
            bytes_processed: 0,
            chunks_processed: 0,
            start: now,
            last_update: now,
            total_bytes,
            recent_throughputs: VecDeque::with_capacity(THROUGHPUT_WINDOW),
        }
    }

    /// Record one processed chunk of `chunk_bytes` bytes and return the
    /// updated snapshot.
    pub fn update(&mut self, chunk_bytes: usize) -> ProgressSnapshot {
        let now = Instant::now();
        let mut delta = now.duration_since(self.last_update).as_secs_f64();
        if delta <= 0.0 {
            // Sub-resolution update: fall back to the coarser total elapsed
            // time, clamped away from zero.
            delta = now
                .duration_since(self.start)
                .as_secs_f64()
                .max(Duration::from_millis(1).as_secs_f64());
        }

        let sample = chunk_bytes as f64 / delta;
        if sample.is_finite() && sample <= MAX_SANE_THROUGHPUT {
            if self.recent_throughputs.len() == THROUGHPUT_WINDOW {
                self.recent_throughputs.pop_front();
            }
            self.recent_throughputs.push_back(sample);
        }

        self.bytes_processed += chunk_bytes as u64;
        self.chunks_processed += 1;
        self.last_update = now;

        self.snapshot_at(now)
    }

    /// Current snapshot without recording a chunk.
    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.snapshot_at(Instant::now())
    }

    fn snapshot_at(&self, now: Instant) -> ProgressSnapshot {
        let throughput = if self.recent_throughputs.is_empty() {
            0.0
        } else {
            self.recent_throughputs.iter().sum::<f64>() / self.recent_throughputs.len() as f64
        };

        let eta_seconds = self.total_bytes.and_then(|total| {
            if throughput > 0.0 {
                let remaining = total.saturating_sub(self.bytes_processed) as f64;
                Some((remaining / throughput).max(0.0))
            } else {
                None
            }
        });

        let percent = self.total_bytes.map(|total| {
            if total == 0 {
                100.0
            } else {
                (self.bytes_processed as f64 * 100.0 / total as f64).min(100.0)
            }
        });

        ProgressSnapshot {
            bytes_processed: self.bytes_processed,
            chunks_processed: self.chunks_processed,
            throughput_bytes_per_sec: throughput,
            eta_seconds,
            percent,
            elapsed: now.duration_since(self.start),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_bytes_and_chunks() {
        let mut tracker = ProgressTracker::new(Some(100));
        let snap = tracker.update(40);
        assert_eq!(snap.bytes_processed, 40);
        assert_eq!(snap.chunks_processed, 1);
        let snap = tracker.update(60);
        assert_eq!(snap.bytes_processed, 100);
        assert_eq!(snap.chunks_processed, 2);
        assert_eq!(snap.percent, Some(100.0));
    }

    #[test]
    fn percent_is_capped() {
        let mut tracker = ProgressTracker::new(Some(10));
        tracker.update(25);
        assert_eq!(tracker.snapshot().percent, Some(100.0));
    }

    #[test]
    fn unknown_total_has_no_percent_or_eta() {
        let mut tracker = ProgressTracker::new(None);
        let snap = tracker.update(1024);
        assert_eq!(snap.percent, None);
        assert_eq!(snap.eta_seconds, None);
    }

    #[test]
    fn throughput_window_is_bounded() {
        let mut tracker = ProgressTracker::new(None);
        for _ in 0..20 {
            tracker.update(1024);
        }
        assert!(tracker.recent_throughputs.len() <= THROUGHPUT_WINDOW);
        assert!(tracker.snapshot().throughput_bytes_per_sec > 0.0);
    }

    #[test]
    fn eta_decreases_towards_zero() {
        let mut tracker = ProgressTracker::new(Some(2048));
        tracker.update(1024);
        let early = tracker.snapshot().eta_seconds.unwrap();
        tracker.update(1024);
        let done = tracker.snapshot().eta_seconds.unwrap();
        assert!(done <= early);
        assert!(done >= 0.0);
    }
}
