//! Session lifecycle and LSN bookkeeping.

use crate::utils::XLogRecPtr;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::info;

/// Lifecycle phases of a replication session.
///
/// `Init → SlotReady → Streaming → Draining → Terminated`; an operational
/// error in the first two phases is fatal with no retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Init,
    SlotReady,
    Streaming,
    Draining,
    Terminated,
}

impl SessionPhase {
    fn can_advance_to(self, next: SessionPhase) -> bool {
        matches!(
            (self, next),
            (SessionPhase::Init, SessionPhase::SlotReady)
                | (SessionPhase::SlotReady, SessionPhase::Streaming)
                | (SessionPhase::Streaming, SessionPhase::Draining)
                | (SessionPhase::Draining, SessionPhase::Terminated)
        )
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Init => "init",
            SessionPhase::SlotReady => "slot-ready",
            SessionPhase::Streaming => "streaming",
            SessionPhase::Draining => "draining",
            SessionPhase::Terminated => "terminated",
        };
        write!(f, "{name}")
    }
}

/// Mutable state of a running session: current phase, LSN high-water
/// marks, and feedback timing.
///
/// Both LSN fields are running maxima, so a late-completing worker can
/// never drag the reported flush position backwards.
#[derive(Debug)]
pub struct SessionState {
    phase: SessionPhase,
    /// Highest `data_start` received from the server.
    pub received_lsn: XLogRecPtr,
    /// Highest LSN safe to report as flushed under the error policy.
    pub flushed_lsn: XLogRecPtr,
    last_feedback_time: Instant,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            phase: SessionPhase::Init,
            received_lsn: 0,
            flushed_lsn: 0,
            last_feedback_time: Instant::now(),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Move to the next lifecycle phase. Transitions outside the state
    /// machine indicate a session bug.
    pub fn advance_phase(&mut self, next: SessionPhase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "illegal phase transition {} -> {}",
            self.phase,
            next
        );
        info!(from = %self.phase, to = %next, "session phase change");
        self.phase = next;
    }

    pub fn update_received_lsn(&mut self, lsn: XLogRecPtr) {
        if lsn > 0 {
            self.received_lsn = self.received_lsn.max(lsn);
        }
    }

    pub fn update_flushed_lsn(&mut self, lsn: XLogRecPtr) {
        if lsn > 0 {
            self.flushed_lsn = self.flushed_lsn.max(lsn);
        }
    }

    pub fn feedback_due(&self, interval: Duration) -> bool {
        self.last_feedback_time.elapsed() > interval
    }

    pub fn mark_feedback_sent(&mut self) {
        self.last_feedback_time = Instant::now();
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_the_full_lifecycle() {
        let mut state = SessionState::new();
        assert_eq!(state.phase(), SessionPhase::Init);

        for phase in [
            SessionPhase::SlotReady,
            SessionPhase::Streaming,
            SessionPhase::Draining,
            SessionPhase::Terminated,
        ] {
            state.advance_phase(phase);
            assert_eq!(state.phase(), phase);
        }
    }

    #[test]
    #[should_panic(expected = "illegal phase transition")]
    fn rejects_skipping_phases() {
        let mut state = SessionState::new();
        state.advance_phase(SessionPhase::Streaming);
    }

    #[test]
    fn lsns_are_monotonic() {
        let mut state = SessionState::new();

        state.update_received_lsn(200);
        state.update_received_lsn(100);
        assert_eq!(state.received_lsn, 200);

        // A late completion for an older event must not move the flush
        // position backwards.
        state.update_flushed_lsn(180);
        state.update_flushed_lsn(120);
        assert_eq!(state.flushed_lsn, 180);

        state.update_flushed_lsn(0);
        assert_eq!(state.flushed_lsn, 180);
    }
}
