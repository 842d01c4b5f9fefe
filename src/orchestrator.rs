//! Session orchestrator.
//!
//! Public-facing coordinator wiring the gate, watchdog, and reconnect
//! coordinator together. Every control-plane mutation — user commands,
//! watchdog ticks, transport callbacks, delayed rebuilds — is funneled into
//! one single-consumer loop, so run state, session state, and the session
//! handle are never touched from two threads at once. Observers read
//! immutable snapshots through `watch` channels.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::anomaly::Severity;
use crate::clock::Clock;
use crate::config::{ReconnectPolicy, SessionSettings, WatchdogConfig};
use crate::gate::{RunState, RunStateGate};
use crate::monitor::{HealthMonitor, WatchdogStats};
use crate::reconnect::{RebuildRequest, ReconnectCoordinator, ReconnectOutcome};
use crate::session::{
    CameraFacing, SessionError, SessionFactory, SessionHandle, SessionState, TransportEvent,
};

/// Push-updated user-intent flags for UI/telemetry observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ControlFlags {
    pub muted: bool,
    pub torch_on: bool,
    pub facing: CameraFacing,
}

impl Default for ControlFlags {
    fn default() -> Self {
        Self {
            muted: false,
            torch_on: false,
            facing: CameraFacing::Back,
        }
    }
}

/// A session build still pending after this many watchdog ticks is
/// abandoned and its epoch retired, so a wedged engine init cannot freeze
/// the supervision loop.
const INIT_DEADLINE_TICKS: u32 = 12;

enum Command {
    Start {
        url: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Transport(TransportEvent),
    InitDone {
        epoch: u64,
        result: Result<Arc<dyn SessionHandle>, SessionError>,
    },
    UpdateWatchdog(WatchdogConfig),
    UpdateSettings(SessionSettings),
    SetMuted(bool),
    SetBitrate(u64),
    ToggleTorch {
        reply: oneshot::Sender<bool>,
    },
    SwitchCamera,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Clonable sender the transport engine uses to push callback events into
/// the control loop.
#[derive(Clone)]
pub struct TransportEventSender {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl TransportEventSender {
    pub fn send(&self, event: TransportEvent) {
        let _ = self.cmd_tx.send(Command::Transport(event));
    }
}

/// Handle to a spawned supervision loop.
pub struct SessionOrchestrator {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<SessionState>,
    stats_rx: watch::Receiver<WatchdogStats>,
    flags_rx: watch::Receiver<ControlFlags>,
    task: JoinHandle<()>,
}

impl SessionOrchestrator {
    /// Spawns the control loop and the watchdog ticker.
    pub fn spawn(
        factory: Arc<dyn SessionFactory>,
        settings: SessionSettings,
        watchdog_config: WatchdogConfig,
        policy: ReconnectPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let gate = Arc::new(RunStateGate::new());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        let (rebuild_tx, rebuild_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (flags_tx, flags_rx) = watch::channel(ControlFlags {
            facing: settings.camera_facing,
            ..ControlFlags::default()
        });

        let mut monitor =
            HealthMonitor::new(gate.clone(), clock.clone(), watchdog_config, tick_tx);
        let stats_rx = monitor.subscribe_stats();
        monitor.start();

        let coordinator = ReconnectCoordinator::new(gate.clone(), clock, policy);

        let facing = settings.camera_facing;
        let supervisor = Supervisor {
            gate,
            monitor,
            coordinator,
            factory,
            settings,
            session: None,
            last_url: None,
            epoch: 0,
            init_in_flight: false,
            deferred_ticks: 0,
            muted: false,
            torch_on: false,
            facing,
            state_tx,
            flags_tx,
            cmd_tx: cmd_tx.clone(),
            rebuild_tx,
        };

        let task = tokio::spawn(supervisor.run(cmd_rx, tick_rx, rebuild_rx));

        Self {
            cmd_tx,
            state_rx,
            stats_rx,
            flags_rx,
            task,
        }
    }

    /// Starts a session towards `url`. Valid from Idle and Error only.
    pub async fn start(&self, url: impl Into<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Start {
                url: url.into(),
                reply,
            })
            .map_err(|_| anyhow!("orchestrator is shut down"))?;
        rx.await.map_err(|_| anyhow!("orchestrator is shut down"))?
    }

    /// Stops the session from any state: gate STOPPED, reconnect cancelled,
    /// resources released, state Idle.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stop { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn update_watchdog_config(&self, config: WatchdogConfig) {
        let _ = self.cmd_tx.send(Command::UpdateWatchdog(config));
    }

    /// New settings apply to the next session build.
    pub fn update_settings(&self, settings: SessionSettings) {
        let _ = self.cmd_tx.send(Command::UpdateSettings(settings));
    }

    pub fn set_muted(&self, muted: bool) {
        let _ = self.cmd_tx.send(Command::SetMuted(muted));
    }

    /// Adjusts the target bitrate on the live session and on every session
    /// built afterwards.
    pub fn set_bitrate(&self, bps: u64) {
        let _ = self.cmd_tx.send(Command::SetBitrate(bps));
    }

    /// Toggles the torch; returns the resulting torch state (always false on
    /// the front camera).
    pub async fn toggle_torch(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::ToggleTorch { reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub fn switch_camera(&self) {
        let _ = self.cmd_tx.send(Command::SwitchCamera);
    }

    pub fn event_sender(&self) -> TransportEventSender {
        TransportEventSender {
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    pub fn subscribe_stats(&self) -> watch::Receiver<WatchdogStats> {
        self.stats_rx.clone()
    }

    pub fn subscribe_flags(&self) -> watch::Receiver<ControlFlags> {
        self.flags_rx.clone()
    }

    pub fn flags(&self) -> ControlFlags {
        *self.flags_rx.borrow()
    }

    pub fn state(&self) -> SessionState {
        self.state_rx.borrow().clone()
    }

    pub fn stats(&self) -> WatchdogStats {
        self.stats_rx.borrow().clone()
    }

    /// Stops everything, including the watchdog ticker, and waits for the
    /// control loop to exit.
    pub async fn shutdown(self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
        let _ = self.task.await;
    }
}

struct Supervisor {
    gate: Arc<RunStateGate>,
    monitor: HealthMonitor,
    coordinator: ReconnectCoordinator,
    factory: Arc<dyn SessionFactory>,
    settings: SessionSettings,
    session: Option<Arc<dyn SessionHandle>>,
    last_url: Option<String>,
    /// Bumped on every start/stop; in-flight init results and rebuild
    /// requests from a retired epoch are dropped.
    epoch: u64,
    /// True while a session build for the current epoch is pending; check
    /// passes are deferred so the missing handle is not misread as a failure.
    init_in_flight: bool,
    /// Consecutive ticks deferred by the pending build.
    deferred_ticks: u32,
    muted: bool,
    torch_on: bool,
    facing: CameraFacing,
    state_tx: watch::Sender<SessionState>,
    flags_tx: watch::Sender<ControlFlags>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    rebuild_tx: mpsc::UnboundedSender<RebuildRequest>,
}

impl Supervisor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut tick_rx: mpsc::UnboundedReceiver<()>,
        mut rebuild_rx: mpsc::UnboundedReceiver<RebuildRequest>,
    ) {
        loop {
            tokio::select! {
                command = cmd_rx.recv() => {
                    match command {
                        Some(Command::Shutdown { reply }) => {
                            self.teardown().await;
                            self.monitor.stop();
                            let _ = reply.send(());
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => {
                            self.teardown().await;
                            self.monitor.stop();
                            break;
                        }
                    }
                }
                Some(()) = tick_rx.recv() => self.handle_tick().await,
                Some(request) = rebuild_rx.recv() => self.handle_rebuild(request).await,
            }
        }
        debug!("supervision loop exited");
    }

    fn state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    fn set_state(&self, state: SessionState) {
        if *self.state_tx.borrow() != state {
            info!("session state: {}", state);
        }
        let _ = self.state_tx.send(state);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { url, reply } => {
                let _ = reply.send(self.handle_start(url));
            }
            Command::Stop { reply } => {
                self.teardown().await;
                let _ = reply.send(());
            }
            Command::Transport(event) => self.handle_transport(event).await,
            Command::InitDone { epoch, result } => self.handle_init_done(epoch, result).await,
            Command::UpdateWatchdog(config) => self.monitor.update_config(config),
            Command::UpdateSettings(settings) => {
                info!("session settings updated (applies to next session build)");
                self.settings = settings;
            }
            Command::SetMuted(muted) => {
                self.muted = muted;
                self.publish_flags();
                if let Some(session) = &self.session {
                    let session = session.clone();
                    tokio::spawn(async move {
                        if let Err(e) = session.set_muted(muted).await {
                            warn!("failed to apply mute: {}", e);
                        }
                    });
                }
            }
            Command::SetBitrate(bps) => {
                self.settings.video_bitrate_bps = bps;
                if let Some(session) = &self.session {
                    let session = session.clone();
                    tokio::spawn(async move {
                        if let Err(e) = session.set_bitrate(bps).await {
                            warn!("failed to adjust bitrate: {}", e);
                        }
                    });
                }
            }
            Command::ToggleTorch { reply } => {
                let _ = reply.send(self.handle_toggle_torch());
            }
            Command::SwitchCamera => self.handle_switch_camera(),
            Command::Shutdown { reply } => {
                // run() intercepts shutdown before dispatch; answer the
                // caller anyway rather than leave it hanging.
                warn!("shutdown command reached the dispatch path");
                let _ = reply.send(());
            }
        }
    }

    fn handle_start(&mut self, url: String) -> Result<()> {
        let state = self.state();
        if state.is_active() {
            return Err(anyhow!("session already active ({})", state));
        }

        let session_id = format!("session-{}", Uuid::new_v4());
        info!(%session_id, %url, "starting session");

        self.epoch += 1;
        self.gate.set(RunState::Running);
        self.last_url = Some(url.clone());
        self.set_state(SessionState::Preparing);
        self.spawn_init(url);
        Ok(())
    }

    /// Builds and wires a fresh engine session off the control loop; the
    /// result funnels back in as `InitDone`.
    fn spawn_init(&mut self, url: String) {
        self.init_in_flight = true;
        self.deferred_ticks = 0;
        let factory = self.factory.clone();
        let settings = self.settings.clone();
        let facing = self.facing;
        let epoch = self.epoch;
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let result = build_session(factory, settings, facing, &url).await;
            let _ = cmd_tx.send(Command::InitDone { epoch, result });
        });
    }

    async fn handle_init_done(
        &mut self,
        epoch: u64,
        result: Result<Arc<dyn SessionHandle>, SessionError>,
    ) {
        if epoch != self.epoch {
            // A stop or restart retired this attempt while it was in flight.
            if let Ok(session) = result {
                debug!("discarding session from retired epoch {}", epoch);
                release_best_effort(session.as_ref()).await;
            }
            return;
        }
        self.init_in_flight = false;
        self.deferred_ticks = 0;
        match result {
            Ok(session) => {
                self.monitor.set_session(Some(session.clone()));
                self.session = Some(session);
                // Transport events may already have carried us past
                // Connecting; never move backwards.
                match self.state() {
                    SessionState::Preparing | SessionState::Reconnecting => {
                        self.set_state(SessionState::Connecting);
                    }
                    // The engine connected before the init result landed;
                    // user intent still needs re-applying to this handle.
                    SessionState::Streaming { .. } => self.restore_intent(),
                    _ => {}
                }
            }
            Err(e) => {
                error!("engine init failed: {}", e);
                // Recovery is deferred to the watchdog, which will see the
                // missing session handle on its next tick.
                self.set_state(SessionState::Error {
                    message: e.to_string(),
                });
            }
        }
    }

    async fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ConnectionStarted(url) => {
                debug!(%url, "transport connection started");
            }
            TransportEvent::ConnectionSucceeded => match self.state() {
                SessionState::Preparing
                | SessionState::Connecting
                | SessionState::Reconnecting => {
                    self.set_state(SessionState::Streaming { bitrate_bps: 0 });
                    self.coordinator.reset_backoff();
                    self.restore_intent();
                }
                state => debug!("connection succeeded ignored in state {}", state),
            },
            TransportEvent::ConnectionFailed(reason) => {
                self.terminal_transport_failure(reason).await;
            }
            TransportEvent::Disconnected => {
                self.terminal_transport_failure("transport disconnected".to_string())
                    .await;
            }
            TransportEvent::BitrateSample(bps) => {
                self.monitor.record_bitrate(bps);
                if matches!(self.state(), SessionState::Streaming { .. }) {
                    let _ = self.state_tx.send(SessionState::Streaming { bitrate_bps: bps });
                }
            }
            TransportEvent::AuthError => self.fatal_auth_failure().await,
            TransportEvent::AuthSucceeded => info!("transport authentication succeeded"),
        }
    }

    /// Terminal transport failure: release immediately, surface Error, and
    /// leave recovery to the next watchdog tick. The engine may report the
    /// same underlying failure twice (connection-failed and disconnected);
    /// the state check makes the second report a no-op.
    async fn terminal_transport_failure(&mut self, reason: String) {
        match self.state() {
            SessionState::Connecting | SessionState::Streaming { .. } => {
                warn!("transport failed: {}", reason);
                self.release_session().await;
                self.set_state(SessionState::Error { message: reason });
            }
            state => {
                debug!(
                    "duplicate terminal transport event ignored in state {}: {}",
                    state, reason
                );
            }
        }
    }

    /// Authentication failure is fatal for the session: no automatic retry.
    async fn fatal_auth_failure(&mut self) {
        error!("transport authentication failed, stopping session");
        self.coordinator.cancel();
        self.coordinator.reset_backoff();
        self.gate.set(RunState::Stopped);
        self.release_session().await;
        self.set_state(SessionState::Error {
            message: "authentication failed".to_string(),
        });
    }

    async fn handle_tick(&mut self) {
        if self.init_in_flight {
            // The check pass is deferred, not the cadence: the tick still
            // counts, and a build that outlives the deadline is abandoned.
            self.monitor.note_deferred_tick();
            self.deferred_ticks += 1;
            if self.deferred_ticks >= INIT_DEADLINE_TICKS {
                warn!(
                    ticks = self.deferred_ticks,
                    "session build exceeded its deadline, abandoning it"
                );
                self.epoch += 1;
                self.init_in_flight = false;
                self.deferred_ticks = 0;
                self.set_state(SessionState::Error {
                    message: "session build timed out".to_string(),
                });
            }
            return;
        }
        let anomalies = self.monitor.run_checks();
        for anomaly in anomalies {
            // stop() may have landed between detection and dispatch.
            if self.gate.is_stopped() {
                debug!("gate stopped before anomaly dispatch, dropping");
                return;
            }
            match anomaly.severity() {
                Severity::Warning => {
                    info!("anomaly (warning, notify only): {}", anomaly);
                }
                Severity::Error | Severity::Critical => {
                    self.begin_reconnect(anomaly.to_string()).await;
                }
            }
        }
    }

    async fn begin_reconnect(&mut self, reason: String) {
        if self.coordinator.has_pending() {
            debug!("reconnect already pending, anomaly folded into it");
            return;
        }
        self.release_session().await;
        self.set_state(SessionState::Reconnecting);
        match self
            .coordinator
            .schedule(reason, self.epoch, self.rebuild_tx.clone())
        {
            ReconnectOutcome::Scheduled(delay) => {
                debug!(delay_ms = delay.as_millis() as u64, "rebuild scheduled");
            }
            ReconnectOutcome::Exhausted => {
                error!("reconnect retry window exhausted, giving up");
                self.gate.set(RunState::Stopped);
                self.set_state(SessionState::Error {
                    message: "reconnect retry window exhausted".to_string(),
                });
            }
        }
    }

    async fn handle_rebuild(&mut self, request: RebuildRequest) {
        self.coordinator.cancel();
        if request.epoch != self.epoch {
            debug!("stale rebuild request from epoch {} dropped", request.epoch);
            return;
        }
        if self.gate.is_stopped() {
            debug!("rebuild request dropped, gate stopped");
            return;
        }
        let Some(url) = self.last_url.clone() else {
            warn!("rebuild requested but no endpoint is known");
            return;
        };
        info!(
            attempt = request.attempt,
            reason = %request.reason,
            "rebuilding session"
        );
        self.set_state(SessionState::Reconnecting);
        self.spawn_init(url);
    }

    fn handle_toggle_torch(&mut self) -> bool {
        if self.facing != CameraFacing::Back {
            debug!("torch unavailable on front camera");
            return false;
        }
        self.torch_on = !self.torch_on;
        self.publish_flags();
        if let Some(session) = &self.session {
            let session = session.clone();
            let on = self.torch_on;
            tokio::spawn(async move {
                if let Err(e) = session.set_torch(on).await {
                    warn!("failed to set torch: {}", e);
                }
            });
        }
        self.torch_on
    }

    fn handle_switch_camera(&mut self) {
        self.facing = match self.facing {
            CameraFacing::Back => CameraFacing::Front,
            CameraFacing::Front => CameraFacing::Back,
        };
        // Torch only exists on the back camera.
        if self.facing == CameraFacing::Front {
            self.torch_on = false;
        }
        self.publish_flags();
        info!(facing = ?self.facing, "camera switched");
        if let Some(session) = &self.session {
            let session = session.clone();
            tokio::spawn(async move {
                if let Err(e) = session.switch_facing().await {
                    warn!("failed to switch camera: {}", e);
                }
            });
        }
    }

    fn publish_flags(&self) {
        let _ = self.flags_tx.send(ControlFlags {
            muted: self.muted,
            torch_on: self.torch_on,
            facing: self.facing,
        });
    }

    /// Re-applies user intent (mute, torch) after (re)entering Streaming.
    fn restore_intent(&self) {
        let Some(session) = self.session.clone() else {
            return;
        };
        let muted = self.muted;
        let torch = self.torch_on && self.facing == CameraFacing::Back;
        tokio::spawn(async move {
            if let Err(e) = session.set_muted(muted).await {
                warn!("failed to restore mute state: {}", e);
            }
            if torch {
                if let Err(e) = session.set_torch(true).await {
                    warn!("failed to restore torch state: {}", e);
                }
            }
        });
    }

    /// Full stop: gate STOPPED first so no in-flight check can dispatch,
    /// then reconnect cancellation and best-effort release.
    async fn teardown(&mut self) {
        self.epoch += 1;
        self.init_in_flight = false;
        self.deferred_ticks = 0;
        self.gate.set(RunState::Stopped);
        self.coordinator.cancel();
        self.coordinator.reset_backoff();
        self.release_session().await;
        self.set_state(SessionState::Idle);
        info!("session stopped");
    }

    async fn release_session(&mut self) {
        self.monitor.set_session(None);
        if let Some(session) = self.session.take() {
            release_best_effort(session.as_ref()).await;
        }
    }
}

async fn build_session(
    factory: Arc<dyn SessionFactory>,
    settings: SessionSettings,
    facing: CameraFacing,
    url: &str,
) -> Result<Arc<dyn SessionHandle>, SessionError> {
    let session = factory.create(&settings).await?;
    if !session.prepare_video(&settings).await? {
        return Err(SessionError::PrepareFailed(
            "video parameters rejected".to_string(),
        ));
    }
    if !session.prepare_audio(&settings).await? {
        return Err(SessionError::PrepareFailed(
            "audio parameters rejected".to_string(),
        ));
    }
    session.start_capture(facing).await?;
    session.start_transport(url).await?;
    Ok(session)
}

/// Releases every engine resource, proceeding through all steps regardless
/// of individual failures.
async fn release_best_effort(session: &dyn SessionHandle) {
    if let Err(e) = session.stop_transport().await {
        warn!("stop_transport during release failed: {}", e);
    }
    if let Err(e) = session.stop_capture().await {
        warn!("stop_capture during release failed: {}", e);
    }
    if let Err(e) = session.release().await {
        warn!("release failed: {}", e);
    }
}
