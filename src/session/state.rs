use crate::source::live::{PhaseReceiver, TailPhase};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Externally visible lifecycle of a tail session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    /// At least one source is still waiting for its log group to appear
    WaitingForGroup,
    /// At least one source is replaying its historical window
    DrainingHistory,
    Live,
    /// The watched task stopped; the session closes after the grace period
    DrainingOnTaskStop,
    Closed,
}

/// Derives the session state from the per-source phases.
#[derive(Debug, Clone, Default)]
pub struct StateTracker {
    phases: Arc<Mutex<Vec<PhaseReceiver>>>,
    task_stopping: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, phase: PhaseReceiver) {
        if let Ok(mut phases) = self.phases.lock() {
            phases.push(phase);
        }
    }

    pub fn mark_task_stopping(&self) {
        self.task_stopping.store(true, Ordering::SeqCst);
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn current(&self) -> SessionState {
        if self.closed.load(Ordering::SeqCst) {
            return SessionState::Closed;
        }
        if self.task_stopping.load(Ordering::SeqCst) {
            return SessionState::DrainingOnTaskStop;
        }

        let phases: Vec<TailPhase> = match self.phases.lock() {
            Ok(phases) => phases.iter().map(|rx| *rx.borrow()).collect(),
            Err(_) => return SessionState::Closed,
        };
        derive_state(&phases)
    }
}

/// The least advanced source decides: history still draining anywhere wins
/// over waiting, which wins over live.
fn derive_state(phases: &[TailPhase]) -> SessionState {
    let any = |phase: TailPhase| phases.iter().any(|p| *p == phase);

    if phases.is_empty() || any(TailPhase::Created) {
        SessionState::Created
    } else if any(TailPhase::DrainingHistory) {
        SessionState::DrainingHistory
    } else if any(TailPhase::WaitingForGroup) {
        SessionState::WaitingForGroup
    } else if any(TailPhase::Live) {
        SessionState::Live
    } else {
        // Every source finished
        SessionState::Closed
    }
}
