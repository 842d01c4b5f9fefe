//! Session capability seam and transport surface.
//!
//! The actual capture/encode/transport engine lives outside this crate and is
//! reached only through [`SessionHandle`]. Feedback flows the other way as
//! [`TransportEvent`]s injected into the orchestrator's control loop.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::SessionSettings;

/// Failure surfaced by an engine operation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error("engine prepare failed: {0}")]
    PrepareFailed(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("transport failed: {0}")]
    TransportFailed(String),
    #[error("engine unavailable: {0}")]
    Unavailable(String),
}

/// Which camera the session captures from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraFacing {
    Front,
    Back,
}

/// Capability interface over the external media engine.
///
/// Liveness queries are cheap flag reads and therefore synchronous; control
/// operations may touch hardware and are async so implementations can move
/// blocking work off the control loop.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    /// Configures the video pipeline. Returns false when the engine rejects
    /// the parameters.
    async fn prepare_video(&self, settings: &SessionSettings) -> Result<bool, SessionError>;
    /// Configures the audio pipeline.
    async fn prepare_audio(&self, settings: &SessionSettings) -> Result<bool, SessionError>;
    async fn start_capture(&self, facing: CameraFacing) -> Result<(), SessionError>;
    async fn start_transport(&self, url: &str) -> Result<(), SessionError>;
    async fn stop_transport(&self) -> Result<(), SessionError>;
    async fn stop_capture(&self) -> Result<(), SessionError>;
    /// Releases every engine resource. Best-effort; callers ignore errors.
    async fn release(&self) -> Result<(), SessionError>;

    fn is_streaming(&self) -> bool;
    fn is_capturing(&self) -> bool;

    async fn set_bitrate(&self, bps: u64) -> Result<(), SessionError>;
    async fn switch_facing(&self) -> Result<CameraFacing, SessionError>;
    async fn set_muted(&self, muted: bool) -> Result<(), SessionError>;
    /// Torch is only available on the back camera.
    async fn set_torch(&self, on: bool) -> Result<(), SessionError>;
}

/// Builds fresh engine sessions for the orchestrator and the reconnect path.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(
        &self,
        settings: &SessionSettings,
    ) -> Result<std::sync::Arc<dyn SessionHandle>, SessionError>;
}

/// Asynchronous feedback from the transport engine.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    ConnectionStarted(String),
    ConnectionSucceeded,
    ConnectionFailed(String),
    BitrateSample(u64),
    Disconnected,
    AuthError,
    AuthSucceeded,
}

/// Observer-facing session state; the single source of truth for UI and
/// telemetry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Preparing,
    Connecting,
    Streaming { bitrate_bps: u64 },
    Reconnecting,
    Error { message: String },
}

impl SessionState {
    /// True for every state in which a session is intended to be up.
    pub fn is_active(&self) -> bool {
        !matches!(self, SessionState::Idle | SessionState::Error { .. })
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Preparing => write!(f, "preparing"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Streaming { bitrate_bps } => {
                write!(f, "streaming at {} bps", bitrate_bps)
            }
            SessionState::Reconnecting => write!(f, "reconnecting"),
            SessionState::Error { message } => write!(f, "error: {}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_states() {
        assert!(!SessionState::Idle.is_active());
        assert!(!SessionState::Error {
            message: "x".into()
        }
        .is_active());
        assert!(SessionState::Preparing.is_active());
        assert!(SessionState::Streaming { bitrate_bps: 0 }.is_active());
        assert!(SessionState::Reconnecting.is_active());
    }

    #[test]
    fn status_strings_are_deterministic() {
        assert_eq!(
            SessionState::Streaming {
                bitrate_bps: 2_000_000
            }
            .to_string(),
            "streaming at 2000000 bps"
        );
        assert_eq!(
            SessionState::Error {
                message: "authentication failed".into()
            }
            .to_string(),
            "error: authentication failed"
        );
    }
}
