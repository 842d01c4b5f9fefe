//! Reconnect coordinator.
//!
//! Reacts to terminal anomalies and transport failures by scheduling one
//! delayed rebuild at a time. The delay follows [`ReconnectPolicy`]; the
//! pending task re-checks the run-state gate after the wait and aborts
//! silently if the session was stopped meanwhile. A rebuild failure is not
//! rescheduled from here: the next watchdog tick re-detects and re-triggers,
//! which keeps two call sites from racing duplicate retry storms.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::ReconnectPolicy;
use crate::gate::RunStateGate;

/// Delayed rebuild request delivered into the control loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RebuildRequest {
    pub reason: String,
    pub attempt: u32,
    /// Session epoch at scheduling time; the control loop drops requests
    /// from a retired epoch so a stale pending reconnect can never race a
    /// fresh start().
    pub epoch: u64,
}

/// Result of a scheduling request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReconnectOutcome {
    Scheduled(Duration),
    /// The cumulative retry window is spent; the session is terminal.
    Exhausted,
}

/// Consecutive-failure bookkeeping. Reset when a session reaches Streaming
/// or is explicitly stopped.
#[derive(Debug, Default)]
pub struct BackoffState {
    attempts: u32,
    first_failure_at: Option<Instant>,
    last_delay: Option<Duration>,
}

/// `min(base * 2^attempts, max_delay)`, overflow-safe.
pub fn backoff_delay(base: Duration, max_delay: Duration, attempts: u32) -> Duration {
    let factor = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
    let delay = base
        .checked_mul(factor.min(u32::MAX as u64) as u32)
        .unwrap_or(max_delay);
    delay.min(max_delay)
}

/// Adds 0-25% of the delay, scaled by `fraction` in `[0, 1)`, clamped to
/// `max_delay`.
pub fn apply_jitter(delay: Duration, max_delay: Duration, fraction: f64) -> Duration {
    let jitter = delay.mul_f64(0.25 * fraction.clamp(0.0, 1.0));
    (delay + jitter).min(max_delay)
}

pub struct ReconnectCoordinator {
    gate: Arc<RunStateGate>,
    clock: Arc<dyn Clock>,
    policy: ReconnectPolicy,
    backoff: BackoffState,
    pending: Option<JoinHandle<()>>,
}

impl ReconnectCoordinator {
    pub fn new(gate: Arc<RunStateGate>, clock: Arc<dyn Clock>, policy: ReconnectPolicy) -> Self {
        Self {
            gate,
            clock,
            policy,
            backoff: BackoffState::default(),
            pending: None,
        }
    }

    pub fn set_policy(&mut self, policy: ReconnectPolicy) {
        self.policy = policy;
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn attempts(&self) -> u32 {
        self.backoff.attempts
    }

    pub fn last_delay(&self) -> Option<Duration> {
        self.backoff.last_delay
    }

    /// Schedules one rebuild after the policy delay, cancelling any
    /// in-flight attempt first so two rebuilds can never overlap.
    pub fn schedule(
        &mut self,
        reason: String,
        epoch: u64,
        rebuild_tx: mpsc::UnboundedSender<RebuildRequest>,
    ) -> ReconnectOutcome {
        self.cancel();

        let now = self.clock.now();
        let first_failure = *self.backoff.first_failure_at.get_or_insert(now);

        let delay = match &self.policy {
            ReconnectPolicy::FixedDelay { delay } => *delay,
            ReconnectPolicy::ExponentialBackoff {
                base,
                max_delay,
                jitter,
                max_retry_window,
            } => {
                let failing_for = now.saturating_duration_since(first_failure);
                if failing_for > *max_retry_window {
                    warn!(
                        attempts = self.backoff.attempts,
                        failing_for_secs = failing_for.as_secs(),
                        "reconnect retry window exhausted"
                    );
                    return ReconnectOutcome::Exhausted;
                }
                let raw = backoff_delay(*base, *max_delay, self.backoff.attempts);
                if *jitter {
                    apply_jitter(raw, *max_delay, rand::random::<f64>())
                } else {
                    raw
                }
            }
        };

        let attempt = self.backoff.attempts;
        self.backoff.attempts = self.backoff.attempts.saturating_add(1);
        self.backoff.last_delay = Some(delay);

        info!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            %reason,
            "reconnect scheduled"
        );

        let gate = self.gate.clone();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The session may have been stopped during the wait.
            if gate.is_stopped() {
                debug!("gate stopped during reconnect delay, aborting rebuild");
                return;
            }
            let _ = rebuild_tx.send(RebuildRequest {
                reason,
                attempt,
                epoch,
            });
        }));

        ReconnectOutcome::Scheduled(delay)
    }

    /// Retires the pending rebuild task. Idempotent; must run before any
    /// session teardown so a stale attempt cannot fire afterwards.
    pub fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
            debug!("pending reconnect cancelled");
        }
    }

    /// Clears consecutive-failure state once a session is healthy again or
    /// explicitly stopped.
    pub fn reset_backoff(&mut self) {
        self.backoff = BackoffState::default();
    }
}
