//! Supervision configuration.
//!
//! All thresholds are independently overridable; defaults are the documented
//! constants below. Durations serialize as integer milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::session::CameraFacing;

/// Watchdog cadence. One check every 5 seconds.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// No bitrate checks until the session is this old (negotiation grace).
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_secs(10);
/// "No sample has ever arrived" trips after this much session time.
pub const DEFAULT_FIRST_SAMPLE_TIMEOUT: Duration = Duration::from_secs(15);
/// A previously seen sample going stale trips after this age.
pub const DEFAULT_BITRATE_TIMEOUT: Duration = Duration::from_secs(30);
/// Samples stopping entirely counts as a streaming timeout after this age.
pub const DEFAULT_STREAMING_TIMEOUT: Duration = Duration::from_secs(45);
/// Below this the bitrate is treated as zero.
pub const DEFAULT_ZERO_BITRATE_BPS: u64 = 10_000;
/// Below this (but above zero threshold) the bitrate is considered low.
pub const DEFAULT_MIN_BITRATE_BPS: u64 = 100_000;
/// Continuous sub-zero-threshold throughput allowed before alarming.
pub const DEFAULT_ZERO_BITRATE_DURATION: Duration = Duration::from_secs(10);
/// Continuous low throughput allowed before alarming.
pub const DEFAULT_LOW_BITRATE_DURATION: Duration = Duration::from_secs(15);
/// Transport not-live for this long counts as stuck.
pub const DEFAULT_CONNECTION_STUCK: Duration = Duration::from_secs(15);
/// Repeats of a debounced anomaly kind are dropped inside this window.
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_secs(30);
/// Coefficient-of-variation limit for the fluctuation check.
pub const DEFAULT_FLUCTUATION_LIMIT: f64 = 0.5;

/// Default reconnect delay for the fixed policy.
pub const DEFAULT_FIXED_DELAY: Duration = Duration::from_secs(3);
/// Exponential backoff base delay.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(2);
/// Exponential backoff delay ceiling. One hour.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(3600);
/// Give up reconnecting after this cumulative window. Thirty days.
pub const DEFAULT_MAX_RETRY_WINDOW: Duration = Duration::from_secs(30 * 24 * 3600);

/// Serde helper: `Duration` as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Thresholds and toggles for the health monitor.
///
/// Replaceable at runtime via the orchestrator; a replacement takes effect
/// on the next tick only, with no retroactive recompute of elapsed timers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    #[serde(with = "duration_ms")]
    pub check_interval: Duration,
    #[serde(with = "duration_ms")]
    pub startup_grace: Duration,
    #[serde(with = "duration_ms")]
    pub first_sample_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub bitrate_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub streaming_timeout: Duration,
    pub zero_bitrate_bps: u64,
    pub min_bitrate_bps: u64,
    #[serde(with = "duration_ms")]
    pub zero_bitrate_duration: Duration,
    #[serde(with = "duration_ms")]
    pub low_bitrate_duration: Duration,
    #[serde(with = "duration_ms")]
    pub connection_stuck_after: Duration,
    #[serde(with = "duration_ms")]
    pub debounce_window: Duration,
    pub fluctuation_limit: f64,
    /// Per-category enables.
    pub check_bitrate: bool,
    pub check_connection: bool,
    pub check_encoder: bool,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            startup_grace: DEFAULT_STARTUP_GRACE,
            first_sample_timeout: DEFAULT_FIRST_SAMPLE_TIMEOUT,
            bitrate_timeout: DEFAULT_BITRATE_TIMEOUT,
            streaming_timeout: DEFAULT_STREAMING_TIMEOUT,
            zero_bitrate_bps: DEFAULT_ZERO_BITRATE_BPS,
            min_bitrate_bps: DEFAULT_MIN_BITRATE_BPS,
            zero_bitrate_duration: DEFAULT_ZERO_BITRATE_DURATION,
            low_bitrate_duration: DEFAULT_LOW_BITRATE_DURATION,
            connection_stuck_after: DEFAULT_CONNECTION_STUCK,
            debounce_window: DEFAULT_DEBOUNCE_WINDOW,
            fluctuation_limit: DEFAULT_FLUCTUATION_LIMIT,
            check_bitrate: true,
            check_connection: true,
            check_encoder: true,
        }
    }
}

/// Delay policy between reconnection attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// Wait a fixed short delay before every rebuild.
    FixedDelay {
        #[serde(with = "duration_ms")]
        delay: Duration,
    },
    /// `min(base * 2^attempts, max_delay)` plus optional 0-25% jitter,
    /// abandoned once `max_retry_window` of cumulative failure has passed.
    ExponentialBackoff {
        #[serde(with = "duration_ms")]
        base: Duration,
        #[serde(with = "duration_ms")]
        max_delay: Duration,
        jitter: bool,
        #[serde(with = "duration_ms")]
        max_retry_window: Duration,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::ExponentialBackoff {
            base: DEFAULT_BACKOFF_BASE,
            max_delay: DEFAULT_MAX_BACKOFF,
            jitter: true,
            max_retry_window: DEFAULT_MAX_RETRY_WINDOW,
        }
    }
}

/// Engine prepare parameters for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub video_width: u32,
    pub video_height: u32,
    pub video_fps: u32,
    pub video_bitrate_bps: u64,
    pub keyframe_interval_secs: u32,
    pub rotation_deg: u32,
    pub audio_bitrate_bps: u64,
    pub audio_sample_rate: u32,
    pub audio_stereo: bool,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub camera_facing: CameraFacing,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            video_width: 1920,
            video_height: 1080,
            video_fps: 30,
            video_bitrate_bps: 2_500_000,
            keyframe_interval_secs: 2,
            rotation_deg: 0,
            audio_bitrate_bps: 128_000,
            audio_sample_rate: 48_000,
            audio_stereo: true,
            echo_cancellation: true,
            noise_suppression: true,
            camera_facing: CameraFacing::Back,
        }
    }
}
