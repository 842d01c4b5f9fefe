//! Stream Sentinel soak harness.
//!
//! Runs the supervision loop against the simulated transport engine with a
//! recurring fault-injection schedule, so the watchdog and reconnect paths
//! can be exercised unattended for long stretches. Pass a JSON config path
//! as the first argument to override watchdog thresholds, the reconnect
//! policy, or session settings.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stream_sentinel::config::{ReconnectPolicy, SessionSettings, WatchdogConfig};
use stream_sentinel::orchestrator::SessionOrchestrator;
use stream_sentinel::sim::SimulatedFactory;
use stream_sentinel::SystemClock;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HarnessConfig {
    endpoint: Option<String>,
    watchdog: WatchdogConfig,
    reconnect: Option<ReconnectPolicy>,
    session: SessionSettings,
    /// Seconds between injected faults. Zero disables injection.
    fault_interval_secs: u64,
}

impl HarnessConfig {
    fn load() -> Result<Self> {
        let Some(path) = std::env::args().nth(1) else {
            return Ok(Self {
                fault_interval_secs: 60,
                ..Self::default()
            });
        };
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path))?;
        serde_json::from_str(&raw).with_context(|| format!("failed to parse config {}", path))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = HarnessConfig::load()?;
    let endpoint = config
        .endpoint
        .clone()
        .unwrap_or_else(|| "rtmp://sim.local/live/soak".to_string());

    info!("stream-sentinel soak harness starting");
    info!(%endpoint, fault_interval_secs = config.fault_interval_secs, "configuration loaded");

    let factory = SimulatedFactory::new();
    let orchestrator = SessionOrchestrator::spawn(
        factory.clone(),
        config.session,
        config.watchdog,
        config.reconnect.unwrap_or_default(),
        Arc::new(SystemClock),
    );
    factory.connect(orchestrator.event_sender());

    orchestrator
        .start(endpoint)
        .await
        .context("failed to start session")?;

    // Log every state transition.
    let mut state_rx = orchestrator.subscribe_state();
    tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let state = state_rx.borrow().clone();
            info!("observer: session state -> {}", state);
        }
    });

    // Periodic stats report.
    let mut stats_rx = orchestrator.subscribe_stats();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            ticker.tick().await;
            let stats = stats_rx.borrow_and_update().clone();
            info!(
                total = stats.total_checks,
                effective = stats.effective_checks,
                skipped = stats.skipped_checks,
                anomalies = stats.anomalies_detected,
                bitrate_bps = stats.current_bitrate_bps,
                "watchdog stats"
            );
        }
    });

    // Rotating fault schedule.
    if config.fault_interval_secs > 0 {
        let factory = factory.clone();
        let interval = Duration::from_secs(config.fault_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            let mut cycle = 0u32;
            loop {
                ticker.tick().await;
                let Some(session) = factory.current() else {
                    warn!("fault schedule: no live session to break");
                    continue;
                };
                match cycle % 4 {
                    0 => {
                        info!("fault schedule: dropping transport");
                        session.drop_transport();
                    }
                    1 => {
                        info!("fault schedule: freezing bitrate samples");
                        session.freeze_samples(true);
                    }
                    2 => {
                        info!("fault schedule: starving bitrate");
                        session.starve_bitrate(true);
                    }
                    _ => {
                        info!("fault schedule: wedging encoder");
                        session.wedge_encoder();
                    }
                }
                cycle = cycle.wrapping_add(1);
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    orchestrator.shutdown().await;
    info!("stream-sentinel stopped");
    Ok(())
}
