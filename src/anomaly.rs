//! Health anomaly taxonomy.
//!
//! Every failed health check is represented as data: an [`Anomaly`] variant
//! carrying the structured fields the check observed, a fixed [`Severity`],
//! and a human-readable description derived strictly from those fields.
//! Nothing in the check path throws across the monitor boundary.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// How urgently an anomaly demands action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

/// Stable discriminant used for debounce keying and telemetry labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    ZeroBitrate,
    LowBitrate,
    BitrateFluctuation,
    ConnectionStuck,
    StreamingTimeout,
    EncoderError,
    CameraDisconnected,
}

/// A classified health-check failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    /// No usable throughput for the given duration.
    ZeroBitrate { duration: Duration },
    /// Throughput persistently below the configured minimum.
    LowBitrate { current_bps: u64, threshold_bps: u64 },
    /// Coefficient of variation of recent nonzero samples above limit.
    BitrateFluctuation { variation: f64 },
    /// Transport reports not-live for the given duration.
    ConnectionStuck { duration: Duration },
    /// Bitrate samples stopped arriving for the given duration.
    StreamingTimeout { duration: Duration },
    /// Capture is active but the encoder/transport is not producing.
    EncoderError { message: String },
    /// Capture device gone or no session associated.
    CameraDisconnected,
}

impl Anomaly {
    pub fn kind(&self) -> AnomalyKind {
        match self {
            Anomaly::ZeroBitrate { .. } => AnomalyKind::ZeroBitrate,
            Anomaly::LowBitrate { .. } => AnomalyKind::LowBitrate,
            Anomaly::BitrateFluctuation { .. } => AnomalyKind::BitrateFluctuation,
            Anomaly::ConnectionStuck { .. } => AnomalyKind::ConnectionStuck,
            Anomaly::StreamingTimeout { .. } => AnomalyKind::StreamingTimeout,
            Anomaly::EncoderError { .. } => AnomalyKind::EncoderError,
            Anomaly::CameraDisconnected => AnomalyKind::CameraDisconnected,
        }
    }

    /// Severity is fixed per kind.
    pub fn severity(&self) -> Severity {
        match self {
            Anomaly::ZeroBitrate { .. } => Severity::Critical,
            Anomaly::LowBitrate { .. } => Severity::Warning,
            Anomaly::BitrateFluctuation { .. } => Severity::Warning,
            Anomaly::ConnectionStuck { .. } => Severity::Critical,
            Anomaly::StreamingTimeout { .. } => Severity::Error,
            Anomaly::EncoderError { .. } => Severity::Error,
            Anomaly::CameraDisconnected => Severity::Critical,
        }
    }

    /// Whether repeats of this kind are suppressed within the debounce
    /// window. Terminal-style failures bypass debounce so recovery starts
    /// promptly; noisy signals do not.
    pub fn debounced(&self) -> bool {
        matches!(
            self.kind(),
            AnomalyKind::LowBitrate | AnomalyKind::BitrateFluctuation
        )
    }
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anomaly::ZeroBitrate { duration } => {
                write!(f, "no throughput for {}s", duration.as_secs())
            }
            Anomaly::LowBitrate {
                current_bps,
                threshold_bps,
            } => write!(
                f,
                "bitrate {} bps below minimum {} bps",
                current_bps, threshold_bps
            ),
            Anomaly::BitrateFluctuation { variation } => {
                write!(f, "bitrate unstable (coefficient of variation {:.2})", variation)
            }
            Anomaly::ConnectionStuck { duration } => {
                write!(f, "connection not live for {}s", duration.as_secs())
            }
            Anomaly::StreamingTimeout { duration } => {
                write!(f, "no bitrate samples for {}s", duration.as_secs())
            }
            Anomaly::EncoderError { message } => write!(f, "encoder error: {}", message),
            Anomaly::CameraDisconnected => write!(f, "camera disconnected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_is_fixed_per_kind() {
        assert_eq!(
            Anomaly::ZeroBitrate {
                duration: Duration::from_secs(12)
            }
            .severity(),
            Severity::Critical
        );
        assert_eq!(
            Anomaly::LowBitrate {
                current_bps: 50_000,
                threshold_bps: 100_000
            }
            .severity(),
            Severity::Warning
        );
        assert_eq!(Anomaly::CameraDisconnected.severity(), Severity::Critical);
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Critical);
    }

    #[test]
    fn only_noisy_kinds_are_debounced() {
        assert!(Anomaly::BitrateFluctuation { variation: 0.8 }.debounced());
        assert!(Anomaly::LowBitrate {
            current_bps: 1,
            threshold_bps: 2
        }
        .debounced());
        assert!(!Anomaly::CameraDisconnected.debounced());
        assert!(!Anomaly::ZeroBitrate {
            duration: Duration::ZERO
        }
        .debounced());
    }

    #[test]
    fn description_is_derived_from_fields() {
        let anomaly = Anomaly::LowBitrate {
            current_bps: 42_000,
            threshold_bps: 100_000,
        };
        assert_eq!(
            anomaly.to_string(),
            "bitrate 42000 bps below minimum 100000 bps"
        );
    }

    #[test]
    fn serializes_with_kind_tag() {
        let json = serde_json::to_value(&Anomaly::CameraDisconnected).unwrap();
        assert_eq!(json["kind"], "camera_disconnected");
    }
}
