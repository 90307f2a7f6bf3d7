use bytes::Buf;

use crate::error::{Result, VmControllerError};
use crate::id_translator::IdTranslator;
use crate::wire::frame::RawFrame;

pub(crate) mod codes {
    pub const HAND_SHAKE_RESULT: u8 = 0x81;
    pub const DEBUGGING_REPLY: u8 = 0x82;
    pub const PROCESS_BREAKPOINT: u8 = 0x83;
    pub const PROCESS_SET_BREAKPOINT: u8 = 0x84;
    pub const PROCESS_DELETE_BREAKPOINT: u8 = 0x85;
    pub const PROCESS_BACKTRACE: u8 = 0x86;
    pub const PROCESS_NUMBER_OF_STACKS: u8 = 0x87;
    pub const PROCESS_GET_PROCESS_IDS_RESULT: u8 = 0x88;
    pub const UNCAUGHT_EXCEPTION: u8 = 0x89;
    pub const PROCESS_COMPILE_TIME_ERROR: u8 = 0x8a;
    pub const PROCESS_TERMINATED: u8 = 0x8b;
    pub const STDOUT_DATA: u8 = 0x8c;
    pub const STDERR_DATA: u8 = 0x8d;
    pub const DART_VALUE: u8 = 0x8e;
    pub const INSTANCE_STRUCTURE: u8 = 0x8f;
    pub const ARRAY_STRUCTURE: u8 = 0x90;
    pub const PROGRAM_INFO_COMMAND: u8 = 0x91;
}

pub use codes::{STDERR_DATA, STDOUT_DATA};

/// Every frame the controller can receive from the VM, plus the synthetic
/// `ConnectionError` sentinel materialized locally when the stream ends or
/// a decode fails (§4.1, §4.8). `DartValue` carries a flat textual
/// representation; structured values nest further frames, assembled by
/// [`crate::remote_value`].
#[derive(Debug, Clone, PartialEq)]
pub enum InboundCommand {
    ConnectionError,
    HandShakeResult,
    DebuggingReply {
        is_from_snapshot: bool,
        snapshot_hash: u64,
    },
    ProcessBreakpoint {
        process_id: u32,
        breakpoint_id: u32,
        function_id: u64,
        bytecode_index: u64,
    },
    ProcessSetBreakpoint {
        value: u32,
    },
    ProcessDeleteBreakpoint {
        id: u32,
    },
    ProcessBacktrace {
        frames: u32,
        function_ids: Vec<u64>,
        bytecode_indices: Vec<u64>,
    },
    ProcessNumberOfStacks {
        value: u32,
    },
    ProcessGetProcessIdsResult {
        ids: Vec<u32>,
    },
    UncaughtException {
        process_id: u32,
        function_id: u64,
        bytecode_index: u64,
    },
    ProcessCompileTimeError,
    ProcessTerminated,
    StdoutData {
        bytes: Vec<u8>,
    },
    StderrData {
        bytes: Vec<u8>,
    },
    DartValue {
        repr: String,
    },
    InstanceStructure {
        class_id: u64,
        field_count: u32,
    },
    ArrayStructure {
        start_index: u32,
        end_index: u32,
    },
    ProgramInfoCommand,
}

impl InboundCommand {
    /// A stop, per §4.8: the Request/Reply Engine resets debug state,
    /// transitions `vmState`, and dispatches a listener callback for any
    /// of these.
    pub fn is_process_stop(&self) -> bool {
        matches!(
            self,
            InboundCommand::ProcessBreakpoint { .. }
                | InboundCommand::UncaughtException { .. }
                | InboundCommand::ProcessCompileTimeError
                | InboundCommand::ProcessTerminated
                | InboundCommand::ConnectionError
        )
    }

    pub fn decode(frame: RawFrame, ids: &IdTranslator) -> Result<InboundCommand> {
        let RawFrame { code, mut payload } = frame;
        let cmd = match code {
            codes::HAND_SHAKE_RESULT => InboundCommand::HandShakeResult,
            codes::DEBUGGING_REPLY => {
                require(&payload, 9, code)?;
                let is_from_snapshot = payload.get_u8() != 0;
                let snapshot_hash = payload.get_u64();
                InboundCommand::DebuggingReply {
                    is_from_snapshot,
                    snapshot_hash,
                }
            }
            codes::PROCESS_BREAKPOINT => {
                require(&payload, 24, code)?;
                let process_id = payload.get_u32();
                let breakpoint_id = payload.get_u32();
                let function_id = ids.wire_to_function_id(payload.get_u64());
                let bytecode_index = payload.get_u64();
                InboundCommand::ProcessBreakpoint {
                    process_id,
                    breakpoint_id,
                    function_id,
                    bytecode_index,
                }
            }
            codes::PROCESS_SET_BREAKPOINT => {
                require(&payload, 4, code)?;
                InboundCommand::ProcessSetBreakpoint {
                    value: payload.get_u32(),
                }
            }
            codes::PROCESS_DELETE_BREAKPOINT => {
                require(&payload, 4, code)?;
                InboundCommand::ProcessDeleteBreakpoint {
                    id: payload.get_u32(),
                }
            }
            codes::PROCESS_BACKTRACE => {
                require(&payload, 4, code)?;
                let frames = payload.get_u32();
                let mut function_ids = Vec::with_capacity(frames as usize);
                let mut bytecode_indices = Vec::with_capacity(frames as usize);
                for _ in 0..frames {
                    require(&payload, 16, code)?;
                    function_ids.push(ids.wire_to_function_id(payload.get_u64()));
                    bytecode_indices.push(payload.get_u64());
                }
                InboundCommand::ProcessBacktrace {
                    frames,
                    function_ids,
                    bytecode_indices,
                }
            }
            codes::PROCESS_NUMBER_OF_STACKS => {
                require(&payload, 4, code)?;
                InboundCommand::ProcessNumberOfStacks {
                    value: payload.get_u32(),
                }
            }
            codes::PROCESS_GET_PROCESS_IDS_RESULT => {
                require(&payload, 4, code)?;
                let n = payload.get_u32();
                let mut ids_out = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    require(&payload, 4, code)?;
                    ids_out.push(payload.get_u32());
                }
                InboundCommand::ProcessGetProcessIdsResult { ids: ids_out }
            }
            codes::UNCAUGHT_EXCEPTION => {
                require(&payload, 20, code)?;
                let process_id = payload.get_u32();
                let function_id = ids.wire_to_function_id(payload.get_u64());
                let bytecode_index = payload.get_u64();
                InboundCommand::UncaughtException {
                    process_id,
                    function_id,
                    bytecode_index,
                }
            }
            codes::PROCESS_COMPILE_TIME_ERROR => InboundCommand::ProcessCompileTimeError,
            codes::PROCESS_TERMINATED => InboundCommand::ProcessTerminated,
            codes::STDOUT_DATA => InboundCommand::StdoutData {
                bytes: payload.to_vec(),
            },
            codes::STDERR_DATA => InboundCommand::StderrData {
                bytes: payload.to_vec(),
            },
            codes::DART_VALUE => InboundCommand::DartValue {
                repr: String::from_utf8_lossy(&payload).into_owned(),
            },
            codes::INSTANCE_STRUCTURE => {
                require(&payload, 12, code)?;
                let class_id = ids.wire_to_class_id(payload.get_u64());
                let field_count = payload.get_u32();
                InboundCommand::InstanceStructure {
                    class_id,
                    field_count,
                }
            }
            codes::ARRAY_STRUCTURE => {
                require(&payload, 8, code)?;
                let start_index = payload.get_u32();
                let end_index = payload.get_u32();
                InboundCommand::ArrayStructure {
                    start_index,
                    end_index,
                }
            }
            codes::PROGRAM_INFO_COMMAND => InboundCommand::ProgramInfoCommand,
            other => {
                return Err(VmControllerError::Decode(format!(
                    "unrecognized inbound command code {other:#x}"
                )))
            }
        };
        Ok(cmd)
    }
}

fn require(payload: &[u8], needed: usize, code: u8) -> Result<()> {
    if payload.len() < needed {
        return Err(VmControllerError::Decode(format!(
            "frame with code {code:#x} needs at least {needed} bytes, got {}",
            payload.len()
        )));
    }
    Ok(())
}
