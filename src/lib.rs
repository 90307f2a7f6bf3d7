//! Client-side state machine and protocol driver for a VM debug session
//! (§1): encodes outbound commands, demultiplexes inbound frames, tracks
//! session and debug state, and exposes the high-level operations a
//! debugger front end drives a VM connection with.
//!
//! [`controller::VmDebugController`] is the crate's entry point. Everything
//! else — the wire codec, the command/reply model, the session state
//! machine, the debug state store, the id-offset translator, and the
//! listener registry — is assembled underneath it per §2.

pub mod config;
pub mod connection;
pub mod controller;
pub mod debug_state;
pub mod engine;
pub mod error;
pub mod exit_code;
pub mod id_translator;
pub mod listener;
pub mod remote_value;
pub mod state_machine;
pub mod system;
pub mod wire;

pub use config::{SessionConfig, SessionConfigBuilder};
pub use connection::{Connection, DuplexConnection, TcpConnection};
pub use controller::VmDebugController;
pub use debug_state::{BackTrace, BackTraceFrame, Breakpoint, DebugState};
pub use error::{Result, VmControllerError};
pub use id_translator::{IdOffsetMapping, IdTranslator, NameOffsetMapping};
pub use listener::{ListenerRegistry, VmListener};
pub use remote_value::{RemoteErrorObject, RemoteValue};
pub use state_machine::{SessionStateMachine, VmState};
pub use system::{
    CompilationDelta, Compiler, DebugInfo, FunctionKind, FunctionRef, InitializeSystem,
    SourceLocation, System,
};
pub use wire::{
    Command, ExpectedReplies, FrameCodec, GenericCommand, InboundCommand, MapKind, OutboundFrame,
    RawFrame,
};

use std::sync::Once;

static TRACING_INIT: Once = Once::new();

/// Installs a process-wide `tracing_subscriber` formatter driven by
/// `RUST_LOG` (`info` by default), the ambient logging component described
/// in §4.12. Embedders call this once at startup, alongside constructing a
/// [`SessionConfig`] and a [`Connection`]; the crate's own test harness
/// calls it too, so a failing scripted session shows its `tracing` output.
/// Safe to call more than once — only the first call installs anything.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .try_init();
    });
}
