//! Connection quality: throughput/RTT estimation and periodic sampling.

pub mod bandwidth;
pub mod monitor;

pub use bandwidth::BandwidthEstimator;
pub use monitor::{ConnectionQualitySample, DEFAULT_SAMPLE_INTERVAL, QualityLevel, QualityMonitor};
