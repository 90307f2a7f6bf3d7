use tracing::debug;

use crate::error::{Result, VmControllerError};

/// The session lifecycle (§3/§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Initial,
    Spawned,
    Running,
    Paused,
    Terminating,
    Terminated,
}

impl VmState {
    pub fn is_paused(&self) -> bool {
        matches!(self, VmState::Paused)
    }

    pub fn is_spawned(&self) -> bool {
        !matches!(self, VmState::Initial)
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, VmState::Terminated)
    }
}

/// Owns the current [`VmState`] and enforces the transition table in
/// §4.7. Every transition is logged at `debug!` so a session's lifecycle
/// can be reconstructed from logs alone.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    state: VmState,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        SessionStateMachine {
            state: VmState::Initial,
        }
    }
}

impl SessionStateMachine {
    pub fn new() -> SessionStateMachine {
        SessionStateMachine::default()
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    fn transition(&mut self, to: VmState) {
        debug!(from = ?self.state, to = ?to, "vm state transition");
        self.state = to;
    }

    pub fn on_spawned(&mut self) {
        self.transition(VmState::Spawned);
    }

    pub fn on_run_sent(&mut self) {
        self.transition(VmState::Running);
    }

    pub fn on_breakpoint_hit(&mut self) {
        self.transition(VmState::Paused);
    }

    pub fn on_stopped_terminating(&mut self) {
        self.transition(VmState::Terminating);
    }

    pub fn on_resume_issued(&mut self) {
        self.transition(VmState::Running);
    }

    /// A dropped connection lands the session straight in `Terminated`
    /// with no explicit `shutdown()` call (§4.7: `any | ConnectionError
    /// inbound | terminating -> terminated` collapses to one step here,
    /// since there is no one left to drain replies from).
    pub fn on_connection_error(&mut self) {
        self.transition(VmState::Terminated);
    }

    pub fn on_shutdown_complete(&mut self) {
        self.transition(VmState::Terminated);
    }

    /// Used only by `kill`, which marks the session terminated
    /// unconditionally and never fails (§4.9).
    pub fn force_terminated(&mut self) {
        self.transition(VmState::Terminated);
    }

    /// Caller-error guard: fails with [`VmControllerError::SessionTerminated`]
    /// once the session is terminated, per the invariant in §3.
    pub fn require_not_terminated(&self) -> Result<()> {
        if self.state.is_terminated() {
            Err(VmControllerError::SessionTerminated)
        } else {
            Ok(())
        }
    }

    pub fn require_paused(&self) -> Result<()> {
        if !self.state.is_paused() {
            Err(VmControllerError::IllegalState(format!(
                "expected state Paused, found {:?}",
                self.state
            )))
        } else {
            Ok(())
        }
    }

    pub fn require_spawned(&self) -> Result<()> {
        if !self.state.is_spawned() {
            Err(VmControllerError::IllegalState(format!(
                "expected a spawned session, found {:?}",
                self.state
            )))
        } else {
            Ok(())
        }
    }
}
