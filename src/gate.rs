//! Run-state gate shared between the orchestrator, watchdog, and reconnect
//! coordinator.
//!
//! The gate answers one coarse question: "should anyone be monitoring or
//! reconnecting right now." It deliberately carries no finer session
//! sub-state; that lives in [`crate::session::SessionState`].

use std::sync::atomic::{AtomicBool, Ordering};

/// Intended run state of the supervised session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    Running,
}

/// Atomic STOPPED/RUNNING flag, safe to read and write from any thread.
///
/// Set RUNNING on session start; set STOPPED on explicit stop or an
/// unrecoverable failure (auth error, reconnect window exhausted).
#[derive(Debug, Default)]
pub struct RunStateGate {
    running: AtomicBool,
}

impl RunStateGate {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
        }
    }

    pub fn set(&self, state: RunState) {
        self.running
            .store(state == RunState::Running, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        !self.is_running()
    }

    pub fn state(&self) -> RunState {
        if self.is_running() {
            RunState::Running
        } else {
            RunState::Stopped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn gate_starts_stopped() {
        let gate = RunStateGate::new();
        assert!(gate.is_stopped());
        assert!(!gate.is_running());
        assert_eq!(gate.state(), RunState::Stopped);
    }

    #[test]
    fn gate_transitions_both_ways() {
        let gate = RunStateGate::new();
        gate.set(RunState::Running);
        assert!(gate.is_running());
        gate.set(RunState::Stopped);
        assert!(gate.is_stopped());
    }

    #[test]
    fn gate_is_shareable_across_threads() {
        let gate = Arc::new(RunStateGate::new());
        let writer = {
            let gate = gate.clone();
            std::thread::spawn(move || gate.set(RunState::Running))
        };
        writer.join().unwrap();
        assert!(gate.is_running());
    }
}
