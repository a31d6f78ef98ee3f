//! Throughput and round-trip estimation over a rolling window.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Rolling-window estimator fed with bytes sent and RTT samples.
///
/// Throughput is the byte total over the span of the window. RTT is
/// smoothed with the TCP gain of 1/8; jitter is the mean absolute
/// difference between consecutive RTT samples in the window.
#[derive(Debug)]
pub struct BandwidthEstimator {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
    total_bytes: u64,
    smoothed_rtt_us: Option<u64>,
    last_rtt_us: Option<u64>,
    rtt_deltas: VecDeque<u64>,
}

impl BandwidthEstimator {
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(2))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(64),
            window,
            total_bytes: 0,
            smoothed_rtt_us: None,
            last_rtt_us: None,
            rtt_deltas: VecDeque::with_capacity(32),
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    pub fn record_at(&mut self, when: Instant, bytes: u64) {
        self.samples.push_back((when, bytes));
        self.total_bytes += bytes;
        self.evict(when);
    }

    pub fn record_rtt(&mut self, rtt: Duration) {
        let rtt_us = rtt.as_micros() as u64;
        self.smoothed_rtt_us = Some(match self.smoothed_rtt_us {
            None => rtt_us,
            Some(srtt) => srtt * 7 / 8 + rtt_us / 8,
        });
        if let Some(last) = self.last_rtt_us {
            if self.rtt_deltas.len() == 32 {
                self.rtt_deltas.pop_front();
            }
            self.rtt_deltas.push_back(last.abs_diff(rtt_us));
        }
        self.last_rtt_us = Some(rtt_us);
    }

    /// Bits per second over the window; zero until two samples exist.
    pub fn estimate_bps(&self) -> u64 {
        let (Some((first, first_bytes)), Some((last, _))) = (self.samples.front(), self.samples.back())
        else {
            return 0;
        };
        let span = last.duration_since(*first);
        if span.is_zero() {
            return 0;
        }
        // The first sample closes the interval before the window.
        let bytes = self.total_bytes - first_bytes;
        (bytes as f64 * 8.0 / span.as_secs_f64()) as u64
    }

    /// Smoothed RTT, or zero before the first sample.
    pub fn latency(&self) -> Duration {
        Duration::from_micros(self.smoothed_rtt_us.unwrap_or(0))
    }

    pub fn jitter(&self) -> Duration {
        if self.rtt_deltas.is_empty() {
            return Duration::ZERO;
        }
        let sum: u64 = self.rtt_deltas.iter().sum();
        Duration::from_micros(sum / self.rtt_deltas.len() as u64)
    }

    pub fn has_rtt(&self) -> bool {
        self.smoothed_rtt_us.is_some()
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(ts, bytes)) = self.samples.front() {
            if now.duration_since(ts) > self.window {
                self.samples.pop_front();
                self.total_bytes -= bytes;
            } else {
                break;
            }
        }
    }
}

impl Default for BandwidthEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needs_two_samples() {
        let mut est = BandwidthEstimator::new();
        assert_eq!(est.estimate_bps(), 0);
        est.record(1024);
        assert_eq!(est.estimate_bps(), 0);
    }

    #[test]
    fn bits_per_second_over_span() {
        let mut est = BandwidthEstimator::with_window(Duration::from_secs(5));
        let t0 = Instant::now();
        est.record_at(t0, 0);
        est.record_at(t0 + Duration::from_millis(500), 125_000);
        est.record_at(t0 + Duration::from_secs(1), 125_000);
        // 250 kB in one second.
        assert_eq!(est.estimate_bps(), 2_000_000);
    }

    #[test]
    fn old_samples_leave_the_window() {
        let mut est = BandwidthEstimator::with_window(Duration::from_secs(2));
        let t0 = Instant::now();
        est.record_at(t0, 1_000_000);
        est.record_at(t0 + Duration::from_secs(3), 10);
        est.record_at(t0 + Duration::from_secs(4), 10);
        assert_eq!(est.estimate_bps(), 80);
    }

    #[test]
    fn smoothed_rtt_and_jitter() {
        let mut est = BandwidthEstimator::new();
        assert!(!est.has_rtt());
        est.record_rtt(Duration::from_millis(10));
        assert_eq!(est.latency(), Duration::from_millis(10));
        assert_eq!(est.jitter(), Duration::ZERO);

        est.record_rtt(Duration::from_millis(2));
        assert_eq!(est.latency(), Duration::from_micros(9_000));
        est.record_rtt(Duration::from_millis(6));
        // |10-2| and |2-6| averaged.
        assert_eq!(est.jitter(), Duration::from_millis(6));
    }
}
