use crate::debug_state::{BackTraceFrame, Breakpoint};
use crate::remote_value::RemoteValue;

/// Capability set of lifecycle callbacks a subscriber may implement, per
/// §4.4. Every method has a no-op default, so a listener interested in only
/// `writeStdOut` overrides nothing else — deliberately not a class
/// hierarchy, per the design note in §9.
pub trait VmListener {
    fn process_start(&mut self, _process_id: u32) {}
    fn process_runnable(&mut self, _process_id: u32) {}
    fn process_exit(&mut self, _process_id: u32) {}
    fn pause_start(&mut self, _process_id: u32) {}
    fn pause_exit(&mut self, _process_id: u32, _frame: Option<&BackTraceFrame>) {}
    fn pause_breakpoint(
        &mut self,
        _process_id: u32,
        _frame: Option<&BackTraceFrame>,
        _breakpoint: &Breakpoint,
    ) {
    }
    fn pause_interrupted(&mut self, _process_id: u32, _frame: Option<&BackTraceFrame>) {}
    fn pause_exception(
        &mut self,
        _process_id: u32,
        _frame: Option<&BackTraceFrame>,
        _thrown: &RemoteValue,
    ) {
    }
    fn resume(&mut self, _process_id: u32) {}
    fn breakpoint_added(&mut self, _process_id: u32, _breakpoint: &Breakpoint) {}
    fn breakpoint_removed(&mut self, _process_id: u32, _breakpoint: &Breakpoint) {}
    fn gc(&mut self, _process_id: u32) {}
    fn write_stdout(&mut self, _process_id: u32, _bytes: &[u8]) {}
    fn write_stderr(&mut self, _process_id: u32, _bytes: &[u8]) {}
    fn lost_connection(&mut self) {}
    fn terminated(&mut self) {}
}

/// Ordered fan-out of subscribers. Notifications are dispatched in
/// subscription order; a listener that panics would take the whole session
/// down with it, so instead we only ever call infallible `&mut self`
/// methods here — there is nothing to catch because there is nothing
/// fallible to catch, by construction.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Vec<Box<dyn VmListener + Send>>,
}

impl ListenerRegistry {
    pub fn new() -> ListenerRegistry {
        ListenerRegistry::default()
    }

    pub fn subscribe(&mut self, listener: Box<dyn VmListener + Send>) {
        self.listeners.push(listener);
    }

    pub fn process_start(&mut self, pid: u32) {
        for l in &mut self.listeners {
            l.process_start(pid);
        }
    }

    pub fn process_runnable(&mut self, pid: u32) {
        for l in &mut self.listeners {
            l.process_runnable(pid);
        }
    }

    pub fn process_exit(&mut self, pid: u32) {
        for l in &mut self.listeners {
            l.process_exit(pid);
        }
    }

    pub fn pause_start(&mut self, pid: u32) {
        for l in &mut self.listeners {
            l.pause_start(pid);
        }
    }

    pub fn pause_exit(&mut self, pid: u32, frame: Option<&BackTraceFrame>) {
        for l in &mut self.listeners {
            l.pause_exit(pid, frame);
        }
    }

    pub fn pause_breakpoint(&mut self, pid: u32, frame: Option<&BackTraceFrame>, bp: &Breakpoint) {
        for l in &mut self.listeners {
            l.pause_breakpoint(pid, frame, bp);
        }
    }

    pub fn pause_interrupted(&mut self, pid: u32, frame: Option<&BackTraceFrame>) {
        for l in &mut self.listeners {
            l.pause_interrupted(pid, frame);
        }
    }

    pub fn pause_exception(
        &mut self,
        pid: u32,
        frame: Option<&BackTraceFrame>,
        thrown: &RemoteValue,
    ) {
        for l in &mut self.listeners {
            l.pause_exception(pid, frame, thrown);
        }
    }

    pub fn resume(&mut self, pid: u32) {
        for l in &mut self.listeners {
            l.resume(pid);
        }
    }

    pub fn breakpoint_added(&mut self, pid: u32, bp: &Breakpoint) {
        for l in &mut self.listeners {
            l.breakpoint_added(pid, bp);
        }
    }

    pub fn breakpoint_removed(&mut self, pid: u32, bp: &Breakpoint) {
        for l in &mut self.listeners {
            l.breakpoint_removed(pid, bp);
        }
    }

    pub fn gc(&mut self, pid: u32) {
        for l in &mut self.listeners {
            l.gc(pid);
        }
    }

    pub fn write_stdout(&mut self, pid: u32, bytes: &[u8]) {
        for l in &mut self.listeners {
            l.write_stdout(pid, bytes);
        }
    }

    pub fn write_stderr(&mut self, pid: u32, bytes: &[u8]) {
        for l in &mut self.listeners {
            l.write_stderr(pid, bytes);
        }
    }

    pub fn lost_connection(&mut self) {
        for l in &mut self.listeners {
            l.lost_connection();
        }
    }

    pub fn terminated(&mut self) {
        for l in &mut self.listeners {
            l.terminated();
        }
    }
}
