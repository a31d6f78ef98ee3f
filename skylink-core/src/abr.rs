//! Adaptive bitrate controller.
//!
//! Smooths bandwidth and loss with an EWMA and walks a fixed ladder:
//!
//! ```text
//! down (1 bad sample):       bitrate ×0.75 → fps step → resolution ×0.75
//! up   (N good samples):     resolution    → fps step → bitrate ×1.15
//! ```
//!
//! Every step down also doubles the keyframe interval, up to
//! `max_keyframe_stretch` times the target's, and every step up halves it
//! back toward the target.
//!
//! Encoders often undershoot their target on static content, so low
//! throughput only counts against the link while frames are backing up in
//! the send queue.

use std::time::Duration;

use tracing::{debug, info};

use crate::capture::Resolution;
use crate::encoder::EncodingConfiguration;
use crate::encoder::config::{higher_frame_rate, lower_frame_rate};
use crate::error::SkyError;
use crate::quality::ConnectionQualitySample;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AbrConfig {
    /// EWMA weight of the newest sample.
    pub ewma_alpha: f64,
    /// Smoothed loss fraction above which a sample is bad.
    pub loss_threshold: f64,
    /// Smoothed bandwidth below `ratio × bitrate` is bad while backlogged.
    pub bandwidth_ratio: f64,
    pub latency_ceiling: Duration,
    pub good_samples_to_increase: u32,
    pub min_bitrate: u32,
    pub max_bitrate: u32,
    pub min_frame_rate: u32,
    pub min_resolution: Resolution,
    pub bitrate_step_down: f64,
    pub bitrate_step_up: f64,
    pub resolution_step: f64,
    /// Ceiling on the keyframe interval as a multiple of the target's.
    pub max_keyframe_stretch: u32,
}

impl Default for AbrConfig {
    fn default() -> Self {
        Self {
            ewma_alpha: 0.3,
            loss_threshold: 0.02,
            bandwidth_ratio: 0.5,
            latency_ceiling: Duration::from_millis(150),
            good_samples_to_increase: 5,
            min_bitrate: 250_000,
            max_bitrate: 20_000_000,
            min_frame_rate: 15,
            min_resolution: Resolution::new(640, 360),
            bitrate_step_down: 0.75,
            bitrate_step_up: 1.15,
            resolution_step: 0.75,
            max_keyframe_stretch: 4,
        }
    }
}

impl AbrConfig {
    pub fn validate(&self) -> Result<(), SkyError> {
        if !(0.0..=1.0).contains(&self.ewma_alpha) || self.ewma_alpha == 0.0 {
            return Err(SkyError::InvalidConfig("ewma_alpha must be in (0, 1]".into()));
        }
        if self.good_samples_to_increase < 2 {
            return Err(SkyError::InvalidConfig(
                "good_samples_to_increase must be at least 2".into(),
            ));
        }
        if self.min_bitrate == 0 || self.min_bitrate > self.max_bitrate {
            return Err(SkyError::InvalidConfig(format!(
                "bitrate bounds {}..{} are invalid",
                self.min_bitrate, self.max_bitrate
            )));
        }
        if !(self.bitrate_step_down > 0.0 && self.bitrate_step_down < 1.0)
            || self.bitrate_step_up <= 1.0
            || !(self.resolution_step > 0.0 && self.resolution_step < 1.0)
        {
            return Err(SkyError::InvalidConfig("ABR step factors out of range".into()));
        }
        if self.max_keyframe_stretch == 0 {
            return Err(SkyError::InvalidConfig(
                "max_keyframe_stretch must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbrDecision {
    Hold,
    Decrease(EncodingConfiguration),
    Increase(EncodingConfiguration),
}

pub struct AdaptiveBitrateController {
    config: AbrConfig,
    /// User-requested configuration; steps up never exceed its
    /// resolution or frame rate.
    target: EncodingConfiguration,
    bandwidth: Option<f64>,
    loss: Option<f64>,
    good_streak: u32,
    /// Resolution steps taken below the target.
    resolution_level: i32,
}

impl AdaptiveBitrateController {
    pub fn new(config: AbrConfig, target: EncodingConfiguration) -> Result<Self, SkyError> {
        config.validate()?;
        Ok(Self {
            config,
            target,
            bandwidth: None,
            loss: None,
            good_streak: 0,
            resolution_level: 0,
        })
    }

    /// New user settings: the ladder restarts from them.
    pub fn set_target(&mut self, target: EncodingConfiguration) {
        self.target = target;
        self.resolution_level = 0;
        self.good_streak = 0;
    }

    pub fn smoothed_bandwidth(&self) -> Option<f64> {
        self.bandwidth
    }

    pub fn smoothed_loss(&self) -> Option<f64> {
        self.loss
    }

    fn smooth(previous: Option<f64>, value: f64, alpha: f64) -> f64 {
        match previous {
            None => value,
            Some(prev) => alpha * value + (1.0 - alpha) * prev,
        }
    }

    pub fn update(
        &mut self,
        sample: &ConnectionQualitySample,
        current: &EncodingConfiguration,
    ) -> AbrDecision {
        let alpha = self.config.ewma_alpha;
        let loss = Self::smooth(self.loss, sample.loss, alpha);
        self.loss = Some(loss);
        if sample.bandwidth_bps > 0 {
            self.bandwidth = Some(Self::smooth(self.bandwidth, sample.bandwidth_bps as f64, alpha));
        }

        let starved = sample.send_backlog > 0
            && self
                .bandwidth
                .is_some_and(|bw| bw < self.config.bandwidth_ratio * current.bitrate_bps as f64);
        let bad = loss > self.config.loss_threshold || starved;

        if bad {
            self.good_streak = 0;
            return match self.step_down(current) {
                Some(next) => {
                    info!(
                        loss,
                        starved,
                        bitrate = next.bitrate_bps,
                        fps = next.frame_rate,
                        resolution = %next.resolution,
                        keyframe_interval = next.keyframe_interval,
                        "ABR stepping down"
                    );
                    AbrDecision::Decrease(next)
                }
                None => {
                    debug!("ABR at floor, holding");
                    AbrDecision::Hold
                }
            };
        }

        let good = loss < self.config.loss_threshold / 2.0
            && sample.latency < self.config.latency_ceiling;
        if !good {
            self.good_streak = 0;
            return AbrDecision::Hold;
        }

        self.good_streak += 1;
        if self.good_streak < self.config.good_samples_to_increase {
            return AbrDecision::Hold;
        }
        self.good_streak = 0;
        match self.step_up(current) {
            Some(next) => {
                info!(
                    bitrate = next.bitrate_bps,
                    fps = next.frame_rate,
                    resolution = %next.resolution,
                    keyframe_interval = next.keyframe_interval,
                    "ABR stepping up"
                );
                AbrDecision::Increase(next)
            }
            None => AbrDecision::Hold,
        }
    }

    fn ladder_resolution(&self, level: i32) -> Resolution {
        if level <= 0 {
            self.target.resolution
        } else {
            self.target
                .resolution
                .scaled(self.config.resolution_step.powi(level))
        }
    }

    fn step_down(&mut self, current: &EncodingConfiguration) -> Option<EncodingConfiguration> {
        let mut next = self.ladder_down(current)?;
        let ceiling = self
            .target
            .keyframe_interval
            .saturating_mul(self.config.max_keyframe_stretch);
        next.keyframe_interval = current
            .keyframe_interval
            .saturating_mul(2)
            .min(ceiling)
            .max(current.keyframe_interval);
        Some(next)
    }

    fn step_up(&mut self, current: &EncodingConfiguration) -> Option<EncodingConfiguration> {
        let floor = self.target.keyframe_interval;
        let relaxed = (current.keyframe_interval / 2).max(floor);
        match self.ladder_up(current) {
            Some(mut next) => {
                next.keyframe_interval = relaxed.min(current.keyframe_interval);
                Some(next)
            }
            // Top of the ladder: keep shortening the interval alone.
            None if current.keyframe_interval > floor => Some(EncodingConfiguration {
                keyframe_interval: relaxed,
                ..*current
            }),
            None => None,
        }
    }

    fn ladder_down(&mut self, current: &EncodingConfiguration) -> Option<EncodingConfiguration> {
        let mut next = *current;
        if current.bitrate_bps > self.config.min_bitrate {
            let lowered = (current.bitrate_bps as f64 * self.config.bitrate_step_down).round() as u32;
            next.bitrate_bps = lowered.max(self.config.min_bitrate);
            return Some(next);
        }
        if let Some(fps) =
            lower_frame_rate(current.frame_rate).filter(|&f| f >= self.config.min_frame_rate)
        {
            next.frame_rate = fps;
            return Some(next);
        }
        let candidate = self.ladder_resolution(self.resolution_level + 1);
        if candidate.width >= self.config.min_resolution.width
            && candidate.height >= self.config.min_resolution.height
            && candidate != current.resolution
        {
            self.resolution_level += 1;
            next.resolution = candidate;
            return Some(next);
        }
        None
    }

    fn ladder_up(&mut self, current: &EncodingConfiguration) -> Option<EncodingConfiguration> {
        let mut next = *current;
        if self.resolution_level > 0 {
            self.resolution_level -= 1;
            next.resolution = self.ladder_resolution(self.resolution_level);
            return Some(next);
        }
        if let Some(fps) =
            higher_frame_rate(current.frame_rate).filter(|&f| f <= self.target.frame_rate)
        {
            next.frame_rate = fps;
            return Some(next);
        }
        if current.bitrate_bps < self.config.max_bitrate {
            let raised = (current.bitrate_bps as f64 * self.config.bitrate_step_up).round() as u32;
            next.bitrate_bps = raised.min(self.config.max_bitrate);
            return Some(next);
        }
        None
    }
}
