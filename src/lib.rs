/*!
 * Stream Sentinel Library
 *
 * Supervision and recovery loop for long-running outbound media stream
 * sessions: a watchdog that classifies silent failures, and a reconnect
 * coordinator that rebuilds the session with backoff.
 */

pub mod anomaly;
pub mod clock;
pub mod config;
pub mod gate;
pub mod monitor;
pub mod orchestrator;
pub mod reconnect;
pub mod session;
pub mod sim;

// Re-export commonly used types
pub use anomaly::{Anomaly, AnomalyKind, Severity};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ReconnectPolicy, SessionSettings, WatchdogConfig};
pub use gate::{RunState, RunStateGate};
pub use monitor::{HealthMonitor, WatchdogStats};
pub use orchestrator::{ControlFlags, SessionOrchestrator, TransportEventSender};
pub use reconnect::{ReconnectCoordinator, ReconnectOutcome};
pub use session::{
    CameraFacing, SessionError, SessionFactory, SessionHandle, SessionState, TransportEvent,
};
