/// Exit codes surfaced in [`crate::debug_state::DebugState::interactive_exit_code`].
/// Named the way the VM's own compiler and runtime name theirs so that a value
/// observed here can be cross-referenced against VM-side logs directly.
pub const COMPILER_EXITCODE_CRASH: i32 = 253;
pub const COMPILER_EXITCODE_CONNECTION_ERROR: i32 = 254;
pub const DART_VM_EXITCODE_UNCAUGHT_EXCEPTION: i32 = 255;
pub const DART_VM_EXITCODE_COMPILE_TIME_ERROR: i32 = 252;

pub const UNCAUGHT_EXCEPTION: i32 = DART_VM_EXITCODE_UNCAUGHT_EXCEPTION;
pub const COMPILE_TIME_ERROR: i32 = DART_VM_EXITCODE_COMPILE_TIME_ERROR;
pub const CONNECTION_ERROR: i32 = COMPILER_EXITCODE_CONNECTION_ERROR;
