use std::collections::HashMap;

use crate::remote_value::RemoteValue;
use crate::system::{FunctionRef, SourceLocation};

/// `{id, function, bytecode_index}` per §3. Created from a
/// `ProcessSetBreakpoint` reply; destroyed on explicit delete, session
/// termination, or one-shot consumption.
#[derive(Debug, Clone, PartialEq)]
pub struct Breakpoint {
    pub id: u32,
    pub function: FunctionRef,
    pub bytecode_index: u64,
}

/// One entry of a [`BackTrace`]. Visibility depends on `show_internal_frames`
/// and the function's kind (§3).
#[derive(Debug, Clone, PartialEq)]
pub struct BackTraceFrame {
    pub function: FunctionRef,
    pub bytecode_pointer: u64,
    pub is_visible: bool,
}

impl BackTraceFrame {
    pub fn location(&self) -> SourceLocation {
        SourceLocation {
            function_id: self.function.id,
            bytecode_pointer: self.bytecode_pointer,
        }
    }
}

/// Ordered back trace, cached per-pause and invalidated on any transition
/// out of `paused` (§3).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BackTrace {
    frames: Vec<BackTraceFrame>,
}

impl BackTrace {
    pub fn new(frames: Vec<BackTraceFrame>) -> BackTrace {
        BackTrace { frames }
    }

    pub fn frames(&self) -> &[BackTraceFrame] {
        &self.frames
    }

    pub fn visible_count(&self) -> usize {
        self.frames.iter().filter(|f| f.is_visible).count()
    }

    /// Maps a visible-frame index to its absolute index in `frames`, or
    /// `None` if out of range — mirrors `actual_frame_number` returning -1
    /// in the source spec.
    pub fn actual_frame_number(&self, visible_index: usize) -> Option<usize> {
        self.frames
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_visible)
            .nth(visible_index)
            .map(|(i, _)| i)
    }

    pub fn top(&self) -> Option<&BackTraceFrame> {
        self.frames.first()
    }
}

/// `{current_process_id, top_frame, breakpoints, current_back_trace?,
/// current_frame_number, show_internal_frames, current_uncaught_exception?}`
/// per §3. Reset on every handled process-stop via [`DebugState::reset`].
#[derive(Debug, Clone, Default)]
pub struct DebugState {
    pub current_process_id: u32,
    pub top_frame: Option<BackTraceFrame>,
    pub current_back_trace: Option<BackTrace>,
    pub breakpoints: HashMap<u32, Breakpoint>,
    pub current_frame_number: usize,
    pub show_internal_frames: bool,
    pub current_uncaught_exception: Option<RemoteValue>,
    pub interactive_exit_code: i32,
}

impl DebugState {
    pub fn new(show_internal_frames: bool) -> DebugState {
        DebugState {
            show_internal_frames,
            ..Default::default()
        }
    }

    /// Clears the current backtrace and uncaught exception, leaving the
    /// breakpoint table intact (§4.6).
    pub fn reset(&mut self) {
        self.current_back_trace = None;
        self.current_uncaught_exception = None;
        self.top_frame = None;
        self.current_frame_number = 0;
    }

    /// Succeeds iff a current back trace exists and `n` maps to a real
    /// frame (§4.6).
    pub fn select_frame(&mut self, n: usize) -> bool {
        match &self.current_back_trace {
            Some(bt) if bt.actual_frame_number(n).is_some() => {
                self.current_frame_number = n;
                true
            }
            _ => false,
        }
    }

    pub fn insert_breakpoint(&mut self, bp: Breakpoint) {
        self.breakpoints.insert(bp.id, bp);
    }

    pub fn remove_breakpoint(&mut self, id: u32) -> Option<Breakpoint> {
        self.breakpoints.remove(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::FunctionKind;

    fn frame(id: u64, visible: bool) -> BackTraceFrame {
        BackTraceFrame {
            function: FunctionRef {
                id,
                name: format!("f{id}"),
                kind: if visible {
                    FunctionKind::User
                } else {
                    FunctionKind::Internal
                },
            },
            bytecode_pointer: 0,
            is_visible: visible,
        }
    }

    #[test]
    fn actual_frame_number_skips_invisible_frames() {
        let bt = BackTrace::new(vec![frame(1, true), frame(2, false), frame(3, true)]);
        assert_eq!(bt.actual_frame_number(0), Some(0));
        assert_eq!(bt.actual_frame_number(1), Some(2));
        assert_eq!(bt.actual_frame_number(2), None);
        assert_eq!(bt.visible_count(), 2);
    }

    #[test]
    fn reset_clears_pause_scoped_state_but_keeps_breakpoints() {
        let mut state = DebugState::new(false);
        state.insert_breakpoint(Breakpoint {
            id: 1,
            function: FunctionRef {
                id: 1,
                name: "f".into(),
                kind: FunctionKind::User,
            },
            bytecode_index: 0,
        });
        state.current_back_trace = Some(BackTrace::new(vec![frame(1, true)]));
        state.reset();
        assert!(state.current_back_trace.is_none());
        assert_eq!(state.breakpoints.len(), 1);
    }

    #[test]
    fn select_frame_requires_existing_back_trace() {
        let mut state = DebugState::new(false);
        assert!(!state.select_frame(0));
        state.current_back_trace = Some(BackTrace::new(vec![frame(1, true)]));
        assert!(state.select_frame(0));
        assert!(!state.select_frame(1));
    }
}
