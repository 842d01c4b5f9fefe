//! Simulated transport engine.
//!
//! Implements [`SessionHandle`] against no real hardware so the supervision
//! loop can be soak-tested unattended: the session pumps synthetic bitrate
//! samples and exposes fault-injection switches (transport drop, sample
//! freeze, capture loss, encoder wedge, auth failure) that reproduce the
//! silent failure modes the watchdog exists to catch.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::SessionSettings;
use crate::orchestrator::TransportEventSender;
use crate::session::{
    CameraFacing, SessionError, SessionFactory, SessionHandle, TransportEvent,
};

/// How often the simulated engine reports throughput.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// One simulated engine session.
pub struct SimulatedSession {
    events: TransportEventSender,
    sample_interval: Duration,
    bitrate_bps: AtomicU64,
    streaming: AtomicBool,
    capturing: AtomicBool,
    released: AtomicBool,
    muted: AtomicBool,
    torch: AtomicBool,
    /// Stops sample emission without touching liveness (silent stall).
    frozen: AtomicBool,
    /// Reports zero throughput while the transport stays "live".
    starved: AtomicBool,
    facing: Mutex<CameraFacing>,
    pump: Mutex<Option<JoinHandle<()>>>,
    weak_self: Weak<SimulatedSession>,
}

impl SimulatedSession {
    fn new(
        events: TransportEventSender,
        settings: &SessionSettings,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            events,
            sample_interval: interval,
            bitrate_bps: AtomicU64::new(settings.video_bitrate_bps),
            streaming: AtomicBool::new(false),
            capturing: AtomicBool::new(false),
            released: AtomicBool::new(false),
            muted: AtomicBool::new(false),
            torch: AtomicBool::new(false),
            frozen: AtomicBool::new(false),
            starved: AtomicBool::new(false),
            facing: Mutex::new(CameraFacing::Back),
            pump: Mutex::new(None),
            weak_self: weak.clone(),
        })
    }

    fn spawn_pump(self: &Arc<Self>) {
        let session = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(session.sample_interval);
            loop {
                ticker.tick().await;
                if session.released.load(Ordering::SeqCst)
                    || !session.streaming.load(Ordering::SeqCst)
                {
                    break;
                }
                if session.frozen.load(Ordering::SeqCst) {
                    continue;
                }
                let bps = if session.starved.load(Ordering::SeqCst) {
                    0
                } else {
                    // Healthy throughput wobbles within +-10% of target.
                    let target = session.bitrate_bps.load(Ordering::SeqCst) as f64;
                    let wobble = rand::thread_rng().gen_range(-0.1..0.1);
                    (target * (1.0 + wobble)) as u64
                };
                session.events.send(TransportEvent::BitrateSample(bps));
            }
        });
        *self.pump.lock().unwrap() = Some(handle);
    }

    // Fault injection.

    /// Kills the transport and reports it, like a broken network path.
    pub fn drop_transport(&self) {
        self.streaming.store(false, Ordering::SeqCst);
        self.events.send(TransportEvent::Disconnected);
    }

    /// Connection stays "live" but samples stop arriving.
    pub fn freeze_samples(&self, frozen: bool) {
        self.frozen.store(frozen, Ordering::SeqCst);
    }

    /// Connection stays live, samples arrive, throughput is zero.
    pub fn starve_bitrate(&self, starved: bool) {
        self.starved.store(starved, Ordering::SeqCst);
    }

    /// Capture device vanishes without any callback.
    pub fn kill_capture(&self) {
        self.capturing.store(false, Ordering::SeqCst);
    }

    /// Encoder wedges: capture stays active, transport silently stops.
    pub fn wedge_encoder(&self) {
        self.streaming.store(false, Ordering::SeqCst);
    }

    pub fn fail_auth(&self) {
        self.events.send(TransportEvent::AuthError);
    }

    pub fn set_target_bitrate(&self, bps: u64) {
        self.bitrate_bps.store(bps, Ordering::SeqCst);
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn torch_on(&self) -> bool {
        self.torch.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionHandle for SimulatedSession {
    async fn prepare_video(&self, settings: &SessionSettings) -> Result<bool, SessionError> {
        Ok(settings.video_width > 0 && settings.video_height > 0 && settings.video_fps > 0)
    }

    async fn prepare_audio(&self, settings: &SessionSettings) -> Result<bool, SessionError> {
        Ok(settings.audio_sample_rate > 0)
    }

    async fn start_capture(&self, facing: CameraFacing) -> Result<(), SessionError> {
        *self.facing.lock().unwrap() = facing;
        self.capturing.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn start_transport(&self, url: &str) -> Result<(), SessionError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(SessionError::Unavailable("session released".to_string()));
        }
        self.streaming.store(true, Ordering::SeqCst);
        self.events
            .send(TransportEvent::ConnectionStarted(url.to_string()));
        self.events.send(TransportEvent::ConnectionSucceeded);
        if let Some(this) = self.weak_self.upgrade() {
            this.spawn_pump();
        }
        Ok(())
    }

    async fn stop_transport(&self) -> Result<(), SessionError> {
        self.streaming.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_capture(&self) -> Result<(), SessionError> {
        self.capturing.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn release(&self) -> Result<(), SessionError> {
        self.released.store(true, Ordering::SeqCst);
        self.streaming.store(false, Ordering::SeqCst);
        self.capturing.store(false, Ordering::SeqCst);
        if let Some(pump) = self.pump.lock().unwrap().take() {
            pump.abort();
        }
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    async fn set_bitrate(&self, bps: u64) -> Result<(), SessionError> {
        self.bitrate_bps.store(bps, Ordering::SeqCst);
        Ok(())
    }

    async fn switch_facing(&self) -> Result<CameraFacing, SessionError> {
        let mut facing = self.facing.lock().unwrap();
        *facing = match *facing {
            CameraFacing::Back => CameraFacing::Front,
            CameraFacing::Front => CameraFacing::Back,
        };
        Ok(*facing)
    }

    async fn set_muted(&self, muted: bool) -> Result<(), SessionError> {
        self.muted.store(muted, Ordering::SeqCst);
        Ok(())
    }

    async fn set_torch(&self, on: bool) -> Result<(), SessionError> {
        if *self.facing.lock().unwrap() != CameraFacing::Back {
            return Err(SessionError::CaptureFailed(
                "torch requires back camera".to_string(),
            ));
        }
        self.torch.store(on, Ordering::SeqCst);
        Ok(())
    }
}

/// Builds [`SimulatedSession`]s and keeps a handle to the live one for
/// fault injection.
pub struct SimulatedFactory {
    events: Mutex<Option<TransportEventSender>>,
    sample_interval: Duration,
    current: Mutex<Option<Arc<SimulatedSession>>>,
    /// Fail this many builds before succeeding (reconnect-path testing).
    fail_builds: AtomicU32,
}

impl SimulatedFactory {
    pub fn new() -> Arc<Self> {
        Self::with_sample_interval(DEFAULT_SAMPLE_INTERVAL)
    }

    pub fn with_sample_interval(interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(None),
            sample_interval: interval,
            current: Mutex::new(None),
            fail_builds: AtomicU32::new(0),
        })
    }

    /// Wires the factory to the orchestrator's callback surface. Must run
    /// before the first session build.
    pub fn connect(&self, events: TransportEventSender) {
        *self.events.lock().unwrap() = Some(events);
    }

    /// The most recently built session, for fault injection.
    pub fn current(&self) -> Option<Arc<SimulatedSession>> {
        self.current.lock().unwrap().clone()
    }

    pub fn fail_next_builds(&self, count: u32) {
        self.fail_builds.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionFactory for SimulatedFactory {
    async fn create(
        &self,
        settings: &SessionSettings,
    ) -> Result<Arc<dyn SessionHandle>, SessionError> {
        let remaining = self.fail_builds.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_builds.store(remaining - 1, Ordering::SeqCst);
            debug!("simulated engine build failure injected");
            return Err(SessionError::Unavailable(
                "simulated engine unavailable".to_string(),
            ));
        }
        let events = self
            .events
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| SessionError::Unavailable("factory not connected".to_string()))?;
        let session = SimulatedSession::new(events, settings, self.sample_interval);
        *self.current.lock().unwrap() = Some(session.clone());
        Ok(session)
    }
}
