use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, VmControllerError};
use crate::id_translator::IdTranslator;
use crate::wire::frame::OutboundFrame;

/// Which side-table `NewMap`/`DeleteMap`/`PushFromMap` operate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    Methods,
    Fibers,
}

impl MapKind {
    fn wire_tag(self) -> u8 {
        match self {
            MapKind::Methods => 0,
            MapKind::Fibers => 1,
        }
    }
}

pub(crate) mod codes {
    pub const DEBUGGING: u8 = 0x01;
    pub const LIVE_EDITING: u8 = 0x02;
    pub const HAND_SHAKE: u8 = 0x03;
    pub const PROCESS_SPAWN_FOR_MAIN: u8 = 0x04;
    pub const PROCESS_RUN: u8 = 0x05;
    pub const PROCESS_CONTINUE: u8 = 0x06;
    pub const PROCESS_STEP_INTO: u8 = 0x07;
    pub const PROCESS_STEP_TO: u8 = 0x08;
    pub const PROCESS_STEP_OVER: u8 = 0x09;
    pub const PROCESS_STEP_OUT: u8 = 0x0a;
    pub const PUSH_FROM_MAP: u8 = 0x0b;
    pub const PROCESS_SET_BREAKPOINT: u8 = 0x0c;
    pub const PROCESS_DELETE_BREAKPOINT: u8 = 0x0d;
    pub const PROCESS_DELETE_ONE_SHOT_BREAKPOINT: u8 = 0x0e;
    pub const PROCESS_BACKTRACE_REQUEST: u8 = 0x0f;
    pub const NEW_MAP: u8 = 0x10;
    pub const DELETE_MAP: u8 = 0x11;
    pub const PROCESS_ADD_FIBERS_TO_MAP: u8 = 0x12;
    pub const PROCESS_FIBER_BACKTRACE_REQUEST: u8 = 0x13;
    pub const PROCESS_GET_PROCESS_IDS: u8 = 0x14;
    pub const PROCESS_UNCAUGHT_EXCEPTION_REQUEST: u8 = 0x15;
    pub const SESSION_END: u8 = 0x16;
    pub const PROCESS_DEBUG_INTERRUPT: u8 = 0x17;
    pub const CREATE_SNAPSHOT: u8 = 0x18;
}

/// How many reply frames a [`Command`] produces once sent, per §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedReplies {
    Fixed(usize),
    Manual,
}

/// Every outbound command this controller can send. Payload-producing
/// fields live directly on the variant; `code`/`expected_replies`/`encode`
/// are the three properties §4.2 requires of every outbound command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Debugging,
    LiveEditing,
    HandShake(u32),
    ProcessSpawnForMain(Vec<String>),
    ProcessRun,
    ProcessContinue,
    ProcessStepInto,
    ProcessStepTo(u64),
    ProcessStepOver,
    ProcessStepOut,
    PushFromMap(MapKind, u64),
    ProcessSetBreakpoint(u64),
    ProcessDeleteBreakpoint(u32),
    ProcessDeleteOneShotBreakpoint(u32),
    ProcessBacktraceRequest(u32),
    NewMap(MapKind),
    DeleteMap(MapKind),
    ProcessAddFibersToMap,
    ProcessFiberBacktraceRequest(u32),
    ProcessGetProcessIds,
    ProcessUncaughtExceptionRequest,
    SessionEnd,
    ProcessDebugInterrupt,
    CreateSnapshot,
}

impl Command {
    pub fn code(&self) -> u8 {
        use codes::*;
        match self {
            Command::Debugging => DEBUGGING,
            Command::LiveEditing => LIVE_EDITING,
            Command::HandShake(_) => HAND_SHAKE,
            Command::ProcessSpawnForMain(_) => PROCESS_SPAWN_FOR_MAIN,
            Command::ProcessRun => PROCESS_RUN,
            Command::ProcessContinue => PROCESS_CONTINUE,
            Command::ProcessStepInto => PROCESS_STEP_INTO,
            Command::ProcessStepTo(_) => PROCESS_STEP_TO,
            Command::ProcessStepOver => PROCESS_STEP_OVER,
            Command::ProcessStepOut => PROCESS_STEP_OUT,
            Command::PushFromMap(..) => PUSH_FROM_MAP,
            Command::ProcessSetBreakpoint(_) => PROCESS_SET_BREAKPOINT,
            Command::ProcessDeleteBreakpoint(_) => PROCESS_DELETE_BREAKPOINT,
            Command::ProcessDeleteOneShotBreakpoint(_) => PROCESS_DELETE_ONE_SHOT_BREAKPOINT,
            Command::ProcessBacktraceRequest(_) => PROCESS_BACKTRACE_REQUEST,
            Command::NewMap(_) => NEW_MAP,
            Command::DeleteMap(_) => DELETE_MAP,
            Command::ProcessAddFibersToMap => PROCESS_ADD_FIBERS_TO_MAP,
            Command::ProcessFiberBacktraceRequest(_) => PROCESS_FIBER_BACKTRACE_REQUEST,
            Command::ProcessGetProcessIds => PROCESS_GET_PROCESS_IDS,
            Command::ProcessUncaughtExceptionRequest => PROCESS_UNCAUGHT_EXCEPTION_REQUEST,
            Command::SessionEnd => SESSION_END,
            Command::ProcessDebugInterrupt => PROCESS_DEBUG_INTERRUPT,
            Command::CreateSnapshot => CREATE_SNAPSHOT,
        }
    }

    /// Declared reply count, per §4.2/§4.8. `HandShake`, `ProcessStepOver`
    /// and `ProcessStepOut` are `Manual`: their replies are a one-shot
    /// breakpoint possibly followed by a stop, or a race against a retry
    /// timer, neither of which fits "read exactly N frames".
    pub fn expected_replies(&self) -> ExpectedReplies {
        use ExpectedReplies::*;
        match self {
            Command::Debugging => Fixed(1),
            Command::LiveEditing => Fixed(0),
            Command::HandShake(_) => Manual,
            Command::ProcessSpawnForMain(_) => Fixed(0),
            Command::ProcessRun => Fixed(1),
            Command::ProcessContinue => Fixed(1),
            Command::ProcessStepInto => Fixed(1),
            Command::ProcessStepTo(_) => Fixed(1),
            Command::ProcessStepOver => Manual,
            Command::ProcessStepOut => Manual,
            Command::PushFromMap(..) => Fixed(0),
            Command::ProcessSetBreakpoint(_) => Fixed(1),
            Command::ProcessDeleteBreakpoint(_) => Fixed(1),
            Command::ProcessDeleteOneShotBreakpoint(_) => Fixed(0),
            Command::ProcessBacktraceRequest(_) => Fixed(1),
            Command::NewMap(_) => Fixed(0),
            Command::DeleteMap(_) => Fixed(0),
            Command::ProcessAddFibersToMap => Fixed(1),
            Command::ProcessFiberBacktraceRequest(_) => Fixed(1),
            Command::ProcessGetProcessIds => Fixed(1),
            Command::ProcessUncaughtExceptionRequest => Fixed(1),
            Command::SessionEnd => Fixed(0),
            Command::ProcessDebugInterrupt => Fixed(0),
            Command::CreateSnapshot => Fixed(1),
        }
    }

    fn write_payload(&self, buf: &mut BytesMut, ids: &IdTranslator) {
        match self {
            Command::HandShake(version) => buf.put_u32(*version),
            Command::ProcessSpawnForMain(args) => {
                buf.put_u32(args.len() as u32);
                for arg in args {
                    buf.put_u32(arg.len() as u32);
                    buf.put_slice(arg.as_bytes());
                }
            }
            Command::ProcessStepTo(bcp) => buf.put_u64(*bcp),
            Command::PushFromMap(kind, id) => {
                buf.put_u8(kind.wire_tag());
                let wire_id = match kind {
                    MapKind::Methods => ids.function_id_to_wire(*id),
                    MapKind::Fibers => *id,
                };
                buf.put_u64(wire_id);
            }
            Command::ProcessSetBreakpoint(bytecode_index) => buf.put_u64(*bytecode_index),
            Command::ProcessDeleteBreakpoint(id) | Command::ProcessDeleteOneShotBreakpoint(id) => {
                buf.put_u32(*id)
            }
            Command::ProcessBacktraceRequest(pid) => buf.put_u32(*pid),
            Command::NewMap(kind) | Command::DeleteMap(kind) => buf.put_u8(kind.wire_tag()),
            Command::ProcessFiberBacktraceRequest(index) => buf.put_u32(*index),
            Command::Debugging
            | Command::LiveEditing
            | Command::ProcessRun
            | Command::ProcessContinue
            | Command::ProcessStepInto
            | Command::ProcessStepOver
            | Command::ProcessStepOut
            | Command::ProcessAddFibersToMap
            | Command::ProcessGetProcessIds
            | Command::ProcessUncaughtExceptionRequest
            | Command::SessionEnd
            | Command::ProcessDebugInterrupt
            | Command::CreateSnapshot => {}
        }
    }

    /// Serialize this command to an [`OutboundFrame`], translating any
    /// function/class ids through `ids` first.
    pub fn encode(&self, ids: &IdTranslator) -> OutboundFrame {
        let mut payload = BytesMut::new();
        self.write_payload(&mut payload, ids);
        OutboundFrame {
            code: self.code(),
            payload: payload.freeze(),
        }
    }
}

/// A [`Command`] known at construction time to have a fixed reply count,
/// the only kind [`crate::engine::RequestReplyEngine::run_commands`]
/// accepts. Constructing one from a `Manual` command fails, so a manual
/// command cannot reach the generic engine by accident.
#[derive(Debug, Clone, PartialEq)]
pub struct GenericCommand(Command);

impl GenericCommand {
    pub fn new(command: Command) -> Result<GenericCommand> {
        match command.expected_replies() {
            ExpectedReplies::Fixed(_) => Ok(GenericCommand(command)),
            ExpectedReplies::Manual => Err(VmControllerError::IllegalState(format!(
                "{command:?} has a manual reply count and cannot be run through run_commands"
            ))),
        }
    }

    pub fn expected_replies(&self) -> usize {
        match self.0.expected_replies() {
            ExpectedReplies::Fixed(n) => n,
            ExpectedReplies::Manual => unreachable!("constructor rejects Manual commands"),
        }
    }

    pub fn encode(&self, ids: &IdTranslator) -> OutboundFrame {
        self.0.encode(ids)
    }

    pub fn into_inner(self) -> Command {
        self.0
    }
}

/// A little-endian-free helper used by outbound payload writers that need
/// to embed raw bytes (stdio echoes in tests, mainly).
pub fn bytes_payload(code: u8, bytes: &[u8]) -> OutboundFrame {
    OutboundFrame {
        code,
        payload: Bytes::copy_from_slice(bytes),
    }
}
