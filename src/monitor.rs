//! Health monitor (watchdog).
//!
//! A recurring tick evaluates bitrate, connection liveness, and
//! encoder/capture health against [`WatchdogConfig`] thresholds whenever the
//! run-state gate is RUNNING, classifies failures as [`Anomaly`] values, and
//! publishes [`WatchdogStats`] snapshots. The ticker task only posts tick
//! requests into the orchestrator's control queue; every check runs on that
//! single consumer, so a stop issued concurrently with a check can never
//! produce an anomaly after the user intended to stop.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::anomaly::{Anomaly, AnomalyKind};
use crate::clock::Clock;
use crate::config::WatchdogConfig;
use crate::gate::RunStateGate;
use crate::session::SessionHandle;

/// Bounded bitrate history capacity.
pub const BITRATE_HISTORY_CAPACITY: usize = 20;
/// Fluctuation check needs at least this many samples in the history.
const FLUCTUATION_MIN_SAMPLES: usize = 10;
/// ... of which at least this many nonzero.
const FLUCTUATION_MIN_NONZERO: usize = 5;

/// Read-only monitoring snapshot, rebuilt after every tick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WatchdogStats {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub total_checks: u64,
    pub effective_checks: u64,
    pub skipped_checks: u64,
    pub anomalies_detected: u64,
    pub last_check_at: Option<DateTime<Utc>>,
    pub current_bitrate_bps: u64,
    pub average_bitrate_bps: u64,
    pub bitrate_history: Vec<u64>,
    pub last_anomaly_at: Option<DateTime<Utc>>,
    pub last_anomaly_kind: Option<AnomalyKind>,
}

/// Sample-path state. Guarded by its own lock because it is touched both by
/// the tick and by the transport callback path.
#[derive(Debug)]
struct SampleTrack {
    current_bps: u64,
    any_seen: bool,
    last_sample_at: Option<Instant>,
    /// First moment throughput dropped below the zero threshold; cleared the
    /// instant a sample at or above the threshold arrives.
    zero_since: Option<Instant>,
    /// Same, for the minimum threshold.
    low_since: Option<Instant>,
    history: VecDeque<u64>,
    zero_threshold_bps: u64,
    min_threshold_bps: u64,
}

impl SampleTrack {
    fn new(config: &WatchdogConfig) -> Self {
        Self {
            current_bps: 0,
            any_seen: false,
            last_sample_at: None,
            zero_since: None,
            low_since: None,
            history: VecDeque::with_capacity(BITRATE_HISTORY_CAPACITY),
            zero_threshold_bps: config.zero_bitrate_bps,
            min_threshold_bps: config.min_bitrate_bps,
        }
    }

    fn record(&mut self, bps: u64, now: Instant) {
        self.current_bps = bps;
        self.any_seen = true;
        self.last_sample_at = Some(now);
        if self.history.len() == BITRATE_HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(bps);

        if bps >= self.zero_threshold_bps {
            self.zero_since = None;
        } else if self.zero_since.is_none() {
            self.zero_since = Some(now);
        }
        if bps >= self.min_threshold_bps {
            self.low_since = None;
        } else if self.low_since.is_none() {
            self.low_since = Some(now);
        }
    }

    fn reset_detection(&mut self) {
        self.current_bps = 0;
        self.any_seen = false;
        self.last_sample_at = None;
        self.zero_since = None;
        self.low_since = None;
    }

    fn average_bps(&self) -> u64 {
        if self.history.is_empty() {
            return 0;
        }
        self.history.iter().sum::<u64>() / self.history.len() as u64
    }

    /// Coefficient of variation of the nonzero history samples, when there is
    /// enough data to be meaningful.
    fn coefficient_of_variation(&self) -> Option<f64> {
        if self.history.len() < FLUCTUATION_MIN_SAMPLES {
            return None;
        }
        let nonzero: Vec<f64> = self
            .history
            .iter()
            .filter(|&&bps| bps > 0)
            .map(|&bps| bps as f64)
            .collect();
        if nonzero.len() < FLUCTUATION_MIN_NONZERO {
            return None;
        }
        let mean = nonzero.iter().sum::<f64>() / nonzero.len() as f64;
        if mean == 0.0 {
            return None;
        }
        let variance =
            nonzero.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / nonzero.len() as f64;
        Some(variance.sqrt() / mean)
    }
}

/// The watchdog itself. Owned by the orchestrator's control loop; the
/// spawned ticker only requests ticks through the shared queue.
pub struct HealthMonitor {
    gate: Arc<RunStateGate>,
    clock: Arc<dyn Clock>,
    config: WatchdogConfig,
    pending_config: Option<WatchdogConfig>,
    session: Option<Arc<dyn SessionHandle>>,
    track: Arc<Mutex<SampleTrack>>,
    running: bool,
    started_at: Option<DateTime<Utc>>,
    session_started_at: Option<Instant>,
    stuck_since: Option<Instant>,
    total_checks: u64,
    effective_checks: u64,
    skipped_checks: u64,
    anomalies_detected: u64,
    last_check_at: Option<DateTime<Utc>>,
    last_anomaly_at: Option<DateTime<Utc>>,
    last_anomaly_kind: Option<AnomalyKind>,
    /// Last dispatch instant per debounced anomaly kind.
    debounce: HashMap<AnomalyKind, Instant>,
    tick_tx: mpsc::UnboundedSender<()>,
    ticker: Option<JoinHandle<()>>,
    stats_tx: watch::Sender<WatchdogStats>,
}

impl HealthMonitor {
    pub fn new(
        gate: Arc<RunStateGate>,
        clock: Arc<dyn Clock>,
        config: WatchdogConfig,
        tick_tx: mpsc::UnboundedSender<()>,
    ) -> Self {
        let track = Arc::new(Mutex::new(SampleTrack::new(&config)));
        let (stats_tx, _) = watch::channel(WatchdogStats::default());
        Self {
            gate,
            clock,
            config,
            pending_config: None,
            session: None,
            track,
            running: false,
            started_at: None,
            session_started_at: None,
            stuck_since: None,
            total_checks: 0,
            effective_checks: 0,
            skipped_checks: 0,
            anomalies_detected: 0,
            last_check_at: None,
            last_anomaly_at: None,
            last_anomaly_kind: None,
            debounce: HashMap::new(),
            tick_tx,
            ticker: None,
            stats_tx,
        }
    }

    /// Starts the recurring tick task. Idempotent: a second start while
    /// running is logged and ignored. Resets per-session detection state
    /// (bitrate history, anomaly timers) but keeps cumulative check counters
    /// across restarts.
    pub fn start(&mut self) {
        if self.running {
            info!("watchdog already running, start ignored");
            return;
        }
        self.running = true;
        self.started_at = Some(Utc::now());
        self.stuck_since = None;
        self.debounce.clear();
        {
            let mut track = self.track.lock().unwrap();
            track.reset_detection();
            track.history.clear();
        }
        self.spawn_ticker(self.config.check_interval);
        info!(
            interval_ms = self.config.check_interval.as_millis() as u64,
            "watchdog started"
        );
        self.publish_stats();
    }

    /// Cancels the ticker. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        if self.running {
            info!("watchdog stopped");
        }
        self.running = false;
        self.publish_stats();
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    fn spawn_ticker(&mut self, period: Duration) {
        if let Some(old) = self.ticker.take() {
            old.abort();
        }
        let tick_tx = self.tick_tx.clone();
        self.ticker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first interval tick fires immediately; skip it so the
            // cadence starts one period after start().
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if tick_tx.send(()).is_err() {
                    break;
                }
            }
        }));
    }

    /// Records a throughput observation from the transport callback path.
    pub fn record_bitrate(&self, bps: u64) {
        let now = self.clock.now();
        self.track.lock().unwrap().record(bps, now);
    }

    /// Associates or clears the live session. Setting a handle re-baselines
    /// the per-session detection timers and discards the previous session's
    /// sample history, so a rebuild at a different bitrate cannot read as
    /// fluctuation.
    pub fn set_session(&mut self, session: Option<Arc<dyn SessionHandle>>) {
        if session.is_some() {
            self.session_started_at = Some(self.clock.now());
            self.stuck_since = None;
            let mut track = self.track.lock().unwrap();
            track.reset_detection();
            track.history.clear();
        } else {
            self.session_started_at = None;
        }
        self.session = session;
    }

    /// Replaces the config. Takes effect on the next tick only; elapsed
    /// timers are not recomputed retroactively.
    pub fn update_config(&mut self, config: WatchdogConfig) {
        self.pending_config = Some(config);
    }

    /// Counts a tick whose check pass was deferred by the caller (a session
    /// build still pending). The tick lands in total and skipped so the
    /// cadence stays visible in the stats even while no checks run.
    pub fn note_deferred_tick(&mut self) {
        self.guarded_increment(CounterSlot::Total);
        self.guarded_increment(CounterSlot::Skipped);
        self.last_check_at = Some(Utc::now());
        self.publish_stats();
    }

    pub fn subscribe_stats(&self) -> watch::Receiver<WatchdogStats> {
        self.stats_tx.subscribe()
    }

    pub fn stats(&self) -> WatchdogStats {
        self.build_stats()
    }

    /// Runs one watchdog check pass and returns the anomalies that survived
    /// gate re-confirmation and debounce. The caller (the control loop)
    /// re-confirms the gate once more before acting on them.
    pub fn run_checks(&mut self) -> Vec<Anomaly> {
        self.apply_pending_config();

        let now = self.clock.now();
        self.guarded_increment(CounterSlot::Total);
        self.last_check_at = Some(Utc::now());

        if self.gate.is_stopped() {
            self.guarded_increment(CounterSlot::Skipped);
            self.publish_stats();
            return Vec::new();
        }
        self.guarded_increment(CounterSlot::Effective);

        let session = self.session.clone();
        let candidates = match session {
            None => vec![Anomaly::CameraDisconnected],
            Some(session) => self.collect_anomalies(now, session.as_ref()),
        };

        let dispatched = self.finalize(candidates, now);
        self.publish_stats();
        dispatched
    }

    fn apply_pending_config(&mut self) {
        let Some(config) = self.pending_config.take() else {
            return;
        };
        let interval_changed = config.check_interval != self.config.check_interval;
        {
            let mut track = self.track.lock().unwrap();
            track.zero_threshold_bps = config.zero_bitrate_bps;
            track.min_threshold_bps = config.min_bitrate_bps;
        }
        self.config = config;
        if interval_changed && self.running {
            self.spawn_ticker(self.config.check_interval);
        }
        debug!("watchdog config replaced");
    }

    /// Runs every enabled check category. A panic inside one category is
    /// contained and converted to an EncoderError anomaly; the tick loop
    /// never stops because a single check failed.
    fn collect_anomalies(&mut self, now: Instant, session: &dyn SessionHandle) -> Vec<Anomaly> {
        let mut candidates = Vec::new();

        if self.config.check_bitrate {
            match catch_unwind(AssertUnwindSafe(|| self.bitrate_checks(now))) {
                Ok(mut found) => candidates.append(&mut found),
                Err(panic) => candidates.push(Anomaly::EncoderError {
                    message: describe_panic(&panic),
                }),
            }
        }
        if self.config.check_connection {
            match catch_unwind(AssertUnwindSafe(|| self.connection_checks(now, session))) {
                Ok(mut found) => candidates.append(&mut found),
                Err(panic) => candidates.push(Anomaly::EncoderError {
                    message: describe_panic(&panic),
                }),
            }
        }
        if self.config.check_encoder {
            match catch_unwind(AssertUnwindSafe(|| encoder_checks(session))) {
                Ok(mut found) => candidates.append(&mut found),
                Err(panic) => candidates.push(Anomaly::EncoderError {
                    message: describe_panic(&panic),
                }),
            }
        }

        candidates
    }

    /// The bitrate ladder: never-sampled, stale sample, continuous zero,
    /// continuous low, then the optional fluctuation check on top.
    fn bitrate_checks(&self, now: Instant) -> Vec<Anomaly> {
        let session_age = match self.session_started_at {
            Some(started) => now.saturating_duration_since(started),
            None => return Vec::new(),
        };
        // Grace period: no bitrate verdicts during negotiation.
        if session_age <= self.config.startup_grace {
            return Vec::new();
        }

        let track = self.track.lock().unwrap();
        let mut out = Vec::new();

        if !track.any_seen {
            if session_age > self.config.first_sample_timeout {
                out.push(Anomaly::ZeroBitrate {
                    duration: session_age,
                });
            }
            return out;
        }

        let sample_age = track
            .last_sample_at
            .map(|last| now.saturating_duration_since(last))
            .unwrap_or(Duration::ZERO);

        if sample_age > self.config.bitrate_timeout {
            out.push(Anomaly::ZeroBitrate {
                duration: sample_age,
            });
        } else if track.current_bps < self.config.zero_bitrate_bps {
            if let Some(since) = track.zero_since {
                let run = now.saturating_duration_since(since);
                if run > self.config.zero_bitrate_duration {
                    out.push(Anomaly::ZeroBitrate { duration: run });
                }
            }
        } else if track.current_bps < self.config.min_bitrate_bps {
            if let Some(since) = track.low_since {
                let run = now.saturating_duration_since(since);
                if run > self.config.low_bitrate_duration {
                    out.push(Anomaly::LowBitrate {
                        current_bps: track.current_bps,
                        threshold_bps: self.config.min_bitrate_bps,
                    });
                }
            }
        }

        if let Some(variation) = track.coefficient_of_variation() {
            if variation > self.config.fluctuation_limit {
                out.push(Anomaly::BitrateFluctuation { variation });
            }
        }

        out
    }

    fn connection_checks(&mut self, now: Instant, session: &dyn SessionHandle) -> Vec<Anomaly> {
        let session_age = match self.session_started_at {
            Some(started) => now.saturating_duration_since(started),
            None => return Vec::new(),
        };
        let mut out = Vec::new();

        if session.is_streaming() {
            self.stuck_since = None;
        } else if session_age > self.config.startup_grace {
            let since = *self.stuck_since.get_or_insert(now);
            let stuck = now.saturating_duration_since(since);
            if stuck > self.config.connection_stuck_after {
                out.push(Anomaly::ConnectionStuck { duration: stuck });
            }
        }

        let track = self.track.lock().unwrap();
        if track.any_seen {
            if let Some(last) = track.last_sample_at {
                let age = now.saturating_duration_since(last);
                if age > self.config.streaming_timeout {
                    out.push(Anomaly::StreamingTimeout { duration: age });
                }
            }
        }

        out
    }

    /// Gate re-confirmation plus debounce, then counter/timestamp updates.
    fn finalize(&mut self, candidates: Vec<Anomaly>, now: Instant) -> Vec<Anomaly> {
        if candidates.is_empty() {
            return candidates;
        }
        // State may have flipped mid-check; drop silently if so.
        if self.gate.is_stopped() {
            debug!("gate stopped mid-check, dropping {} anomalies", candidates.len());
            return Vec::new();
        }

        let mut dispatched = Vec::new();
        for anomaly in candidates {
            if anomaly.debounced() {
                let kind = anomaly.kind();
                if let Some(last) = self.debounce.get(&kind) {
                    if now.saturating_duration_since(*last) < self.config.debounce_window {
                        debug!(?kind, "anomaly suppressed by debounce window");
                        continue;
                    }
                }
                self.debounce.insert(kind, now);
            }
            self.guarded_increment(CounterSlot::Anomalies);
            self.last_anomaly_at = Some(Utc::now());
            self.last_anomaly_kind = Some(anomaly.kind());
            warn!(severity = ?anomaly.severity(), "anomaly detected: {}", anomaly);
            dispatched.push(anomaly);
        }
        dispatched
    }

    /// Monotonic counter bump with saturation protection: on overflow every
    /// cumulative counter resets to zero and the event is logged, the tick
    /// itself is never lost.
    fn guarded_increment(&mut self, slot: CounterSlot) {
        let target = match slot {
            CounterSlot::Total => &mut self.total_checks,
            CounterSlot::Effective => &mut self.effective_checks,
            CounterSlot::Skipped => &mut self.skipped_checks,
            CounterSlot::Anomalies => &mut self.anomalies_detected,
        };
        if *target == u64::MAX {
            warn!("watchdog counter saturated, resetting cumulative counters");
            self.total_checks = 0;
            self.effective_checks = 0;
            self.skipped_checks = 0;
            self.anomalies_detected = 0;
        }
        match slot {
            CounterSlot::Total => self.total_checks += 1,
            CounterSlot::Effective => self.effective_checks += 1,
            CounterSlot::Skipped => self.skipped_checks += 1,
            CounterSlot::Anomalies => self.anomalies_detected += 1,
        }
    }

    fn build_stats(&self) -> WatchdogStats {
        let track = self.track.lock().unwrap();
        WatchdogStats {
            running: self.running,
            started_at: self.started_at,
            total_checks: self.total_checks,
            effective_checks: self.effective_checks,
            skipped_checks: self.skipped_checks,
            anomalies_detected: self.anomalies_detected,
            last_check_at: self.last_check_at,
            current_bitrate_bps: track.current_bps,
            average_bitrate_bps: track.average_bps(),
            bitrate_history: track.history.iter().copied().collect(),
            last_anomaly_at: self.last_anomaly_at,
            last_anomaly_kind: self.last_anomaly_kind,
        }
    }

    fn publish_stats(&self) {
        let _ = self.stats_tx.send(self.build_stats());
    }
}

fn encoder_checks(session: &dyn SessionHandle) -> Vec<Anomaly> {
    if !session.is_capturing() {
        return vec![Anomaly::CameraDisconnected];
    }
    if !session.is_streaming() {
        return vec![Anomaly::EncoderError {
            message: "encoder not running".to_string(),
        }];
    }
    Vec::new()
}

fn describe_panic(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("health check panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("health check panicked: {}", message)
    } else {
        "health check panicked".to_string()
    }
}

enum CounterSlot {
    Total,
    Effective,
    Skipped,
    Anomalies,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SessionSettings;
    use crate::gate::RunState;
    use crate::session::{CameraFacing, SessionError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeSession {
        streaming: AtomicBool,
        capturing: AtomicBool,
    }

    impl FakeSession {
        fn healthy() -> Arc<Self> {
            Arc::new(Self {
                streaming: AtomicBool::new(true),
                capturing: AtomicBool::new(true),
            })
        }

        fn set_streaming(&self, on: bool) {
            self.streaming.store(on, Ordering::SeqCst);
        }

        fn set_capturing(&self, on: bool) {
            self.capturing.store(on, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl SessionHandle for FakeSession {
        async fn prepare_video(&self, _: &SessionSettings) -> Result<bool, SessionError> {
            Ok(true)
        }
        async fn prepare_audio(&self, _: &SessionSettings) -> Result<bool, SessionError> {
            Ok(true)
        }
        async fn start_capture(&self, _: CameraFacing) -> Result<(), SessionError> {
            Ok(())
        }
        async fn start_transport(&self, _: &str) -> Result<(), SessionError> {
            Ok(())
        }
        async fn stop_transport(&self) -> Result<(), SessionError> {
            Ok(())
        }
        async fn stop_capture(&self) -> Result<(), SessionError> {
            Ok(())
        }
        async fn release(&self) -> Result<(), SessionError> {
            Ok(())
        }
        fn is_streaming(&self) -> bool {
            self.streaming.load(Ordering::SeqCst)
        }
        fn is_capturing(&self) -> bool {
            self.capturing.load(Ordering::SeqCst)
        }
        async fn set_bitrate(&self, _: u64) -> Result<(), SessionError> {
            Ok(())
        }
        async fn switch_facing(&self) -> Result<CameraFacing, SessionError> {
            Ok(CameraFacing::Front)
        }
        async fn set_muted(&self, _: bool) -> Result<(), SessionError> {
            Ok(())
        }
        async fn set_torch(&self, _: bool) -> Result<(), SessionError> {
            Ok(())
        }
    }

    struct Harness {
        monitor: HealthMonitor,
        clock: Arc<ManualClock>,
        gate: Arc<RunStateGate>,
        _tick_rx: mpsc::UnboundedReceiver<()>,
    }

    fn harness(config: WatchdogConfig) -> Harness {
        let gate = Arc::new(RunStateGate::new());
        let clock = Arc::new(ManualClock::new());
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        let monitor = HealthMonitor::new(gate.clone(), clock.clone(), config, tick_tx);
        Harness {
            monitor,
            clock,
            gate,
            _tick_rx: tick_rx,
        }
    }

    fn fast_config() -> WatchdogConfig {
        WatchdogConfig {
            startup_grace: Duration::from_secs(2),
            first_sample_timeout: Duration::from_secs(4),
            bitrate_timeout: Duration::from_secs(8),
            streaming_timeout: Duration::from_secs(12),
            zero_bitrate_duration: Duration::from_secs(3),
            low_bitrate_duration: Duration::from_secs(3),
            connection_stuck_after: Duration::from_secs(3),
            debounce_window: Duration::from_secs(30),
            ..WatchdogConfig::default()
        }
    }

    #[test]
    fn stopped_gate_only_increments_skipped() {
        let mut h = harness(fast_config());
        h.gate.set(RunState::Stopped);
        for _ in 0..5 {
            assert!(h.monitor.run_checks().is_empty());
        }
        let stats = h.monitor.stats();
        assert_eq!(stats.total_checks, 5);
        assert_eq!(stats.skipped_checks, 5);
        assert_eq!(stats.effective_checks, 0);
        assert_eq!(stats.anomalies_detected, 0);
    }

    #[test]
    fn missing_session_raises_camera_disconnected() {
        let mut h = harness(fast_config());
        h.gate.set(RunState::Running);
        let anomalies = h.monitor.run_checks();
        assert_eq!(anomalies, vec![Anomaly::CameraDisconnected]);
        assert_eq!(h.monitor.stats().effective_checks, 1);
    }

    #[test]
    fn no_sample_ever_trips_first_sample_timeout() {
        let mut h = harness(fast_config());
        h.gate.set(RunState::Running);
        let session = FakeSession::healthy();
        h.monitor.set_session(Some(session));

        // Inside grace + first-sample timeout: quiet.
        h.clock.advance(Duration::from_secs(3));
        assert!(h.monitor.run_checks().is_empty());

        h.clock.advance(Duration::from_secs(2));
        let anomalies = h.monitor.run_checks();
        assert!(anomalies
            .iter()
            .any(|a| a.kind() == AnomalyKind::ZeroBitrate));
    }

    #[test]
    fn continuous_zero_run_trips_after_window_and_resets_on_recovery() {
        let mut h = harness(fast_config());
        h.gate.set(RunState::Running);
        h.monitor.set_session(Some(FakeSession::healthy()));
        h.clock.advance(Duration::from_secs(3)); // past grace

        // Alternating 0 / 5000 bps: both below the 10 kbps zero threshold,
        // so the continuous run keeps accumulating.
        for _ in 0..2 {
            h.monitor.record_bitrate(0);
            h.clock.advance(Duration::from_secs(1));
            h.monitor.record_bitrate(5_000);
            h.clock.advance(Duration::from_secs(1));
        }
        let anomalies = h.monitor.run_checks();
        assert!(
            anomalies
                .iter()
                .any(|a| a.kind() == AnomalyKind::ZeroBitrate),
            "4s continuous sub-threshold run must exceed the 3s window: {:?}",
            anomalies
        );

        // A sample at the threshold clears the run instantly.
        h.monitor.record_bitrate(10_000);
        h.monitor.record_bitrate(0);
        let anomalies = h.monitor.run_checks();
        assert!(
            !anomalies
                .iter()
                .any(|a| a.kind() == AnomalyKind::ZeroBitrate),
            "run must restart from the recovery sample: {:?}",
            anomalies
        );
    }

    #[test]
    fn low_bitrate_is_debounced() {
        let mut h = harness(fast_config());
        h.gate.set(RunState::Running);
        h.monitor.set_session(Some(FakeSession::healthy()));
        h.clock.advance(Duration::from_secs(3));

        h.monitor.record_bitrate(50_000); // between zero and min thresholds
        h.clock.advance(Duration::from_secs(4));
        h.monitor.record_bitrate(50_000);

        let first = h.monitor.run_checks();
        assert!(first.iter().any(|a| a.kind() == AnomalyKind::LowBitrate));

        // Within the 30s debounce window: suppressed.
        h.clock.advance(Duration::from_secs(5));
        h.monitor.record_bitrate(50_000);
        let second = h.monitor.run_checks();
        assert!(!second.iter().any(|a| a.kind() == AnomalyKind::LowBitrate));

        // Past the window: fires again.
        h.clock.advance(Duration::from_secs(31));
        h.monitor.record_bitrate(50_000);
        let third = h.monitor.run_checks();
        assert!(third.iter().any(|a| a.kind() == AnomalyKind::LowBitrate));
    }

    #[test]
    fn connection_stuck_after_threshold() {
        let mut h = harness(fast_config());
        h.gate.set(RunState::Running);
        let session = FakeSession::healthy();
        session.set_streaming(false);
        h.monitor.set_session(Some(session.clone()));
        h.clock.advance(Duration::from_secs(3)); // past grace
        h.monitor.record_bitrate(500_000);

        assert!(h
            .monitor
            .run_checks()
            .iter()
            .all(|a| a.kind() != AnomalyKind::ConnectionStuck));

        h.clock.advance(Duration::from_secs(4));
        let anomalies = h.monitor.run_checks();
        assert!(anomalies
            .iter()
            .any(|a| a.kind() == AnomalyKind::ConnectionStuck));

        // Liveness returning clears the stuck timer.
        session.set_streaming(true);
        h.monitor.record_bitrate(500_000);
        let anomalies = h.monitor.run_checks();
        assert!(!anomalies
            .iter()
            .any(|a| a.kind() == AnomalyKind::ConnectionStuck));
    }

    #[test]
    fn capture_gone_and_encoder_wedged() {
        let mut h = harness(fast_config());
        h.gate.set(RunState::Running);
        let session = FakeSession::healthy();
        h.monitor.set_session(Some(session.clone()));
        h.monitor.record_bitrate(500_000);

        session.set_capturing(false);
        assert!(h
            .monitor
            .run_checks()
            .contains(&Anomaly::CameraDisconnected));

        session.set_capturing(true);
        session.set_streaming(false);
        h.monitor.record_bitrate(500_000);
        let anomalies = h.monitor.run_checks();
        assert!(anomalies
            .iter()
            .any(|a| matches!(a, Anomaly::EncoderError { message } if message == "encoder not running")));
    }

    #[test]
    fn fluctuation_needs_history_and_high_variation() {
        let mut h = harness(fast_config());
        h.gate.set(RunState::Running);
        h.monitor.set_session(Some(FakeSession::healthy()));
        h.clock.advance(Duration::from_secs(3));

        // Stable samples: plenty of history, low variation.
        for _ in 0..12 {
            h.monitor.record_bitrate(2_000_000);
        }
        assert!(!h
            .monitor
            .run_checks()
            .iter()
            .any(|a| a.kind() == AnomalyKind::BitrateFluctuation));

        // Wildly swinging nonzero samples.
        for i in 0..12u64 {
            h.monitor
                .record_bitrate(if i % 2 == 0 { 200_000 } else { 4_000_000 });
        }
        let anomalies = h.monitor.run_checks();
        assert!(anomalies
            .iter()
            .any(|a| a.kind() == AnomalyKind::BitrateFluctuation));
    }

    #[test]
    fn update_config_applies_on_next_tick_only() {
        let mut h = harness(fast_config());
        h.gate.set(RunState::Running);
        h.monitor.set_session(Some(FakeSession::healthy()));
        h.clock.advance(Duration::from_secs(3));
        h.monitor.record_bitrate(50_000);

        // Pending config with a much higher minimum would flag 50 kbps as
        // low immediately, but nothing is re-evaluated until a tick runs.
        let stricter = WatchdogConfig {
            min_bitrate_bps: 1_000_000,
            low_bitrate_duration: Duration::ZERO,
            ..fast_config()
        };
        h.monitor.update_config(stricter);
        assert_eq!(h.monitor.config.min_bitrate_bps, 100_000);

        h.clock.advance(Duration::from_secs(1));
        h.monitor.record_bitrate(50_000);
        let anomalies = h.monitor.run_checks();
        assert_eq!(h.monitor.config.min_bitrate_bps, 1_000_000);
        assert!(anomalies.iter().any(|a| a.kind() == AnomalyKind::LowBitrate));
    }

    #[test]
    fn counter_overflow_resets_without_missing_the_tick() {
        let mut h = harness(fast_config());
        h.gate.set(RunState::Stopped);
        h.monitor.total_checks = u64::MAX;
        h.monitor.skipped_checks = 17;

        h.monitor.run_checks();
        let stats = h.monitor.stats();
        assert_eq!(stats.total_checks, 1);
        assert_eq!(stats.skipped_checks, 1);
        assert_eq!(stats.effective_checks, 0);
    }

    #[test]
    fn deferred_ticks_count_as_total_and_skipped() {
        let mut h = harness(fast_config());
        h.gate.set(RunState::Running);
        for _ in 0..3 {
            h.monitor.note_deferred_tick();
        }
        let stats = h.monitor.stats();
        assert_eq!(stats.total_checks, 3);
        assert_eq!(stats.skipped_checks, 3);
        assert_eq!(stats.effective_checks, 0);
        assert!(stats.last_check_at.is_some());
    }

    #[test]
    fn new_session_discards_previous_bitrate_history() {
        let mut h = harness(fast_config());
        h.gate.set(RunState::Running);
        h.monitor.set_session(Some(FakeSession::healthy()));
        h.clock.advance(Duration::from_secs(3));

        // First session swings wildly; enough history to trip fluctuation.
        for i in 0..12u64 {
            h.monitor
                .record_bitrate(if i % 2 == 0 { 200_000 } else { 4_000_000 });
        }
        assert!(h
            .monitor
            .run_checks()
            .iter()
            .any(|a| a.kind() == AnomalyKind::BitrateFluctuation));

        // A rebuilt session starts with a clean slate: only its own samples
        // feed the fluctuation check. Move past the debounce window so the
        // earlier dispatch cannot mask a leak.
        h.monitor.set_session(Some(FakeSession::healthy()));
        h.clock.advance(Duration::from_secs(31));
        for _ in 0..4 {
            h.monitor.record_bitrate(2_000_000);
        }
        let anomalies = h.monitor.run_checks();
        assert!(
            !anomalies
                .iter()
                .any(|a| a.kind() == AnomalyKind::BitrateFluctuation),
            "stale history must not leak into the new session: {:?}",
            anomalies
        );
        assert_eq!(h.monitor.stats().bitrate_history.len(), 4);
    }

    #[test]
    fn history_is_bounded() {
        let h = harness(fast_config());
        for i in 0..50u64 {
            h.monitor.record_bitrate(i);
        }
        let stats = h.monitor.stats();
        assert_eq!(stats.bitrate_history.len(), BITRATE_HISTORY_CAPACITY);
        assert_eq!(*stats.bitrate_history.first().unwrap(), 30);
        assert_eq!(*stats.bitrate_history.last().unwrap(), 49);
    }

    #[test]
    fn gate_flip_mid_check_drops_anomalies() {
        let mut h = harness(fast_config());
        h.gate.set(RunState::Running);
        // No session handle would normally raise CameraDisconnected, but the
        // gate flipping before finalization must drop it.
        h.monitor.session = None;
        h.gate.set(RunState::Running);
        // Simulate the race by flipping the gate between detection and
        // finalization: finalize re-reads the gate.
        let candidates = vec![Anomaly::CameraDisconnected];
        h.gate.set(RunState::Stopped);
        let now = h.clock.now();
        let dispatched = h.monitor.finalize(candidates, now);
        assert!(dispatched.is_empty());
        assert_eq!(h.monitor.stats().anomalies_detected, 0);
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_is_repeatable() {
        let mut h = harness(fast_config());
        h.monitor.start();
        assert!(h.monitor.is_running());
        h.monitor.start(); // ignored
        assert!(h.monitor.is_running());
        h.monitor.stop();
        assert!(!h.monitor.is_running());
        h.monitor.stop(); // safe
    }

    #[tokio::test]
    async fn start_preserves_cumulative_counters() {
        let mut h = harness(fast_config());
        h.gate.set(RunState::Stopped);
        h.monitor.run_checks();
        h.monitor.run_checks();
        h.monitor.start();
        assert_eq!(h.monitor.stats().total_checks, 2);
        h.monitor.stop();
    }
}
