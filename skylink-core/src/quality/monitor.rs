//! Periodic link quality sampling.
//!
//! Each interval the monitor reads the link counters and produces a
//! [`ConnectionQualitySample`]:
//!
//! * latency: smoothed heartbeat RTT
//! * jitter: mean absolute change between consecutive RTTs
//! * loss: heartbeats still unanswered when the next one was due
//! * bandwidth: bits actually written to the stream

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::quality::bandwidth::BandwidthEstimator;
use crate::transport::{LinkSender, LinkStats, LinkStatsSnapshot};

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

// ── QualityLevel ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QualityLevel::Poor => "poor",
            QualityLevel::Fair => "fair",
            QualityLevel::Good => "good",
            QualityLevel::Excellent => "excellent",
        };
        f.write_str(s)
    }
}

// ── ConnectionQualitySample ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionQualitySample {
    pub latency: Duration,
    /// Fraction in `0.0..=1.0`.
    pub loss: f64,
    pub bandwidth_bps: u64,
    pub jitter: Duration,
    /// Video frames waiting in the send queue when sampled.
    pub send_backlog: usize,
    pub taken_at: Instant,
}

impl ConnectionQualitySample {
    /// `100 − min(lat/5, 40) − min(loss%·8, 40) − min(jitter/2, 20)`,
    /// latency and jitter in milliseconds.
    pub fn stability_score(&self) -> f64 {
        let latency_ms = self.latency.as_secs_f64() * 1000.0;
        let jitter_ms = self.jitter.as_secs_f64() * 1000.0;
        let loss_pct = self.loss * 100.0;
        let score = 100.0
            - (latency_ms / 5.0).min(40.0)
            - (loss_pct * 8.0).min(40.0)
            - (jitter_ms / 2.0).min(20.0);
        score.clamp(0.0, 100.0)
    }

    pub fn quality_level(&self) -> QualityLevel {
        let stability = self.stability_score();
        let latency_ms = self.latency.as_millis();
        let loss_pct = self.loss * 100.0;

        if stability >= 80.0 && latency_ms < 50 && loss_pct < 1.0 {
            QualityLevel::Excellent
        } else if stability >= 60.0 && latency_ms < 100 && loss_pct < 3.0 {
            QualityLevel::Good
        } else if stability >= 40.0 && latency_ms < 200 && loss_pct < 5.0 {
            QualityLevel::Fair
        } else {
            QualityLevel::Poor
        }
    }
}

// ── QualityMonitor ───────────────────────────────────────────────

pub struct QualityMonitor {
    stats: Arc<LinkStats>,
    estimator: BandwidthEstimator,
    last: LinkStatsSnapshot,
    loss: f64,
}

impl QualityMonitor {
    pub fn new(stats: Arc<LinkStats>) -> Self {
        let last = stats.snapshot();
        Self {
            stats,
            estimator: BandwidthEstimator::new(),
            last,
            loss: 0.0,
        }
    }

    pub fn sample(&mut self, send_backlog: usize) -> ConnectionQualitySample {
        self.sample_at(Instant::now(), send_backlog)
    }

    pub fn sample_at(&mut self, now: Instant, send_backlog: usize) -> ConnectionQualitySample {
        let current = self.stats.snapshot();
        self.estimator
            .record_at(now, current.bytes_sent - self.last.bytes_sent);
        for rtt in self.stats.drain_rtt() {
            self.estimator.record_rtt(rtt);
        }

        let sent = current.heartbeats_sent - self.last.heartbeats_sent;
        let missed = current.heartbeats_missed - self.last.heartbeats_missed;
        if sent > 0 {
            self.loss = (missed as f64 / sent as f64).min(1.0);
        }
        self.last = current;

        ConnectionQualitySample {
            latency: self.estimator.latency(),
            loss: self.loss,
            bandwidth_bps: self.estimator.estimate_bps(),
            jitter: self.estimator.jitter(),
            send_backlog,
            taken_at: now,
        }
    }

    /// Sample every `interval` until cancelled or the receiver is gone.
    pub async fn run(
        mut self,
        link: LinkSender,
        interval: Duration,
        samples: mpsc::Sender<ConnectionQualitySample>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let sample = self.sample(link.video_backlog());
            debug!(
                latency_ms = sample.latency.as_millis() as u64,
                jitter_ms = sample.jitter.as_millis() as u64,
                loss = sample.loss,
                bandwidth_bps = sample.bandwidth_bps,
                level = %sample.quality_level(),
                "quality sample"
            );
            if samples.send(sample).await.is_err() {
                break;
            }
        }
    }
}
