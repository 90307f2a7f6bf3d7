use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio_util::codec::Framed;
use tracing::{debug, error, warn};

use crate::connection::Connection;
use crate::debug_state::{BackTraceFrame, Breakpoint, DebugState};
use crate::error::{Result, VmControllerError};
use crate::exit_code;
use crate::id_translator::IdTranslator;
use crate::listener::ListenerRegistry;
use crate::remote_value::RemoteValue;
use crate::state_machine::SessionStateMachine;
use crate::system::{FunctionRef, System};
use crate::wire::{Command, FrameCodec, GenericCommand, InboundCommand};

/// Placeholder system used before `initialize` has loaded a real one. Every
/// lookup misses, which is exactly right: nothing should be resolving
/// function ids before a system is loaded.
struct EmptySystem;

impl System for EmptySystem {
    fn lookup_function(&self, _id: u64) -> Option<FunctionRef> {
        None
    }

    fn functions_named(&self, _name: &str) -> Vec<FunctionRef> {
        Vec::new()
    }

    fn function_ids_by_name(&self) -> std::collections::HashMap<String, u64> {
        std::collections::HashMap::new()
    }

    fn class_ids_by_name(&self) -> std::collections::HashMap<String, u64> {
        std::collections::HashMap::new()
    }

    fn next_step_target(
        &self,
        _function_id: u64,
        _previous: crate::system::SourceLocation,
    ) -> Option<u64> {
        None
    }
}

/// Drives the wire protocol for one VM connection: encodes outbound
/// commands, demultiplexes inbound frames (§4.3), and applies process-stop
/// handling (§4.8) to the shared [`DebugState`] / [`SessionStateMachine`] /
/// [`ListenerRegistry`]. This is the only thing that ever reads from the
/// connection — the "exactly one reader" invariant in §3 falls out of it
/// being the sole owner of the `Framed` stream.
pub struct RequestReplyEngine<C: Connection> {
    framed: Framed<C, FrameCodec>,
    pub ids: IdTranslator,
    pub state_machine: SessionStateMachine,
    pub debug_state: DebugState,
    pub listeners: ListenerRegistry,
    pub system: Box<dyn System + Send>,
    sentinel_materialized: bool,
}

impl<C: Connection> RequestReplyEngine<C> {
    pub fn new(connection: C, show_internal_frames: bool) -> RequestReplyEngine<C> {
        RequestReplyEngine {
            framed: Framed::new(connection, FrameCodec::default()),
            ids: IdTranslator::Identity,
            state_machine: SessionStateMachine::new(),
            debug_state: DebugState::new(show_internal_frames),
            listeners: ListenerRegistry::new(),
            system: Box::new(EmptySystem),
            sentinel_materialized: false,
        }
    }

    pub fn set_system(&mut self, system: Box<dyn System + Send>) {
        self.system = system;
    }

    fn is_visible(&self, function: &FunctionRef) -> bool {
        self.debug_state.show_internal_frames || function.kind == crate::system::FunctionKind::User
    }

    /// Serializes and writes `cmd`. Fails with `SessionTerminated` once the
    /// session is terminated (§3 invariant).
    pub async fn send(&mut self, cmd: &Command) -> Result<()> {
        self.state_machine.require_not_terminated()?;
        debug!(code = cmd.code(), ?cmd, "sending command");
        let frame = cmd.encode(&self.ids);
        self.framed.send(frame).await.map_err(|e| self.to_connection_error(e))
    }

    fn to_connection_error(&mut self, e: VmControllerError) -> VmControllerError {
        error!(error = %e, "connection write failed");
        self.sentinel_materialized = true;
        VmControllerError::ConnectionLost {
            description: self.framed.get_ref().description().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        }
    }

    /// Reads the next *reply* frame, transparently dispatching and
    /// swallowing stdio frames first (§4.3). Stream termination or a decode
    /// failure materializes the `ConnectionError` sentinel exactly once;
    /// further calls return the same sentinel without touching the stream
    /// again (§4.8).
    pub async fn recv_one(&mut self) -> Result<InboundCommand> {
        if self.sentinel_materialized {
            return Ok(InboundCommand::ConnectionError);
        }
        loop {
            match self.framed.next().await {
                Some(Ok(raw)) => {
                    if raw.code == crate::wire::reply::STDOUT_DATA {
                        let cmd = InboundCommand::decode(raw, &self.ids)?;
                        if let InboundCommand::StdoutData { bytes } = cmd {
                            self.listeners.write_stdout(0, &bytes);
                        }
                        continue;
                    }
                    if raw.code == crate::wire::reply::STDERR_DATA {
                        let cmd = InboundCommand::decode(raw, &self.ids)?;
                        if let InboundCommand::StderrData { bytes } = cmd {
                            self.listeners.write_stderr(0, &bytes);
                        }
                        continue;
                    }
                    let cmd = InboundCommand::decode(raw, &self.ids);
                    match cmd {
                        Ok(cmd) => return Ok(cmd),
                        Err(e) => {
                            warn!(error = %e, "decode failure, materializing ConnectionError");
                            self.sentinel_materialized = true;
                            return Ok(InboundCommand::ConnectionError);
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "connection read failed, materializing ConnectionError");
                    self.sentinel_materialized = true;
                    return Ok(InboundCommand::ConnectionError);
                }
                None => {
                    debug!("connection closed, materializing ConnectionError");
                    self.sentinel_materialized = true;
                    return Ok(InboundCommand::ConnectionError);
                }
            }
        }
    }

    /// Like [`Self::recv_one`] but with a bound: used only by `shutdown`'s
    /// drain, which must not block waiting for frames that will never
    /// arrive (§4.8 `force=false`).
    pub async fn try_recv_one(&mut self) -> Option<InboundCommand> {
        if self.sentinel_materialized {
            return None;
        }
        tokio::time::timeout(Duration::ZERO, self.recv_one())
            .await
            .ok()
            .and_then(|r| r.ok())
    }

    /// Reads one reply and, if it is a process-stop, runs it through
    /// §4.8's process-stop handling before returning it.
    pub async fn recv_and_handle_stop(&mut self) -> Result<InboundCommand> {
        let reply = self.recv_one().await?;
        if reply.is_process_stop() {
            self.handle_process_stop(&reply).await?;
        }
        Ok(reply)
    }

    async fn handle_process_stop(&mut self, reply: &InboundCommand) -> Result<()> {
        let pid_before = self.debug_state.current_process_id;
        self.debug_state.reset();

        match reply {
            InboundCommand::ProcessBreakpoint {
                process_id,
                breakpoint_id,
                function_id,
                bytecode_index,
            } => {
                self.debug_state.interactive_exit_code = 0;
                self.state_machine.on_breakpoint_hit();
                self.debug_state.current_process_id = *process_id;
                let frame = self.resolve_frame(*function_id, *bytecode_index);
                self.debug_state.top_frame = Some(frame.clone());
                match self.debug_state.breakpoints.get(breakpoint_id).cloned() {
                    Some(bp) => self
                        .listeners
                        .pause_breakpoint(*process_id, Some(&frame), &bp),
                    None => self.listeners.pause_interrupted(*process_id, Some(&frame)),
                }
            }
            InboundCommand::UncaughtException {
                process_id,
                function_id,
                bytecode_index,
            } => {
                self.debug_state.interactive_exit_code = exit_code::UNCAUGHT_EXCEPTION;
                self.state_machine.on_stopped_terminating();
                self.debug_state.current_process_id = *process_id;
                let frame = self.resolve_frame(*function_id, *bytecode_index);
                self.debug_state.top_frame = Some(frame.clone());
                self.send(&Command::ProcessUncaughtExceptionRequest).await?;
                let thrown = self.read_structured_value().await?;
                self.debug_state.current_uncaught_exception = Some(thrown.clone());
                self.listeners
                    .pause_exception(*process_id, Some(&frame), &thrown);
            }
            InboundCommand::ProcessCompileTimeError => {
                self.debug_state.interactive_exit_code = exit_code::COMPILE_TIME_ERROR;
                self.state_machine.on_stopped_terminating();
            }
            InboundCommand::ProcessTerminated => {
                self.debug_state.interactive_exit_code = 0;
                self.state_machine.on_stopped_terminating();
                self.debug_state.current_process_id = pid_before;
                self.listeners.process_exit(pid_before);
            }
            InboundCommand::ConnectionError => {
                self.debug_state.interactive_exit_code = exit_code::CONNECTION_ERROR;
                self.state_machine.on_connection_error();
                self.listeners.lost_connection();
            }
            other => {
                return Err(VmControllerError::ProtocolViolation {
                    expected: "a process-stop frame".into(),
                    found: format!("{other:?}"),
                })
            }
        }
        Ok(())
    }

    fn resolve_frame(&self, function_id: u64, bytecode_pointer: u64) -> BackTraceFrame {
        let function = self
            .system
            .lookup_function(function_id)
            .unwrap_or_else(|| FunctionRef::missing(function_id));
        let is_visible = self.is_visible(&function);
        BackTraceFrame {
            function,
            bytecode_pointer,
            is_visible,
        }
    }

    /// Structured object reads (§4.9): read one frame, then recurse as many
    /// times as the frame declares.
    pub async fn read_structured_value(&mut self) -> Result<RemoteValue> {
        let frame = self.recv_one().await?;
        match frame {
            InboundCommand::DartValue { repr } => Ok(RemoteValue::Primitive(repr)),
            InboundCommand::InstanceStructure {
                class_id,
                field_count,
            } => {
                let mut fields = Vec::with_capacity(field_count as usize);
                for _ in 0..field_count {
                    fields.push(Box::pin(self.read_structured_value()).await?);
                }
                Ok(RemoteValue::Instance { class_id, fields })
            }
            InboundCommand::ArrayStructure {
                start_index,
                end_index,
            } => {
                let count = end_index.saturating_sub(start_index);
                let mut elements = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    elements.push(Box::pin(self.read_structured_value()).await?);
                }
                Ok(RemoteValue::Array { elements })
            }
            other => Ok(RemoteValue::error(format!(
                "unexpected frame in structured read: {other:?}"
            ))),
        }
    }

    /// `run_commands` per §4.8: send each command in order, read exactly
    /// its declared reply count, keep only the very last reply seen across
    /// the whole call.
    pub async fn run_commands(
        &mut self,
        commands: Vec<GenericCommand>,
    ) -> Result<Option<InboundCommand>> {
        let mut last_reply = None;
        for command in commands {
            let expected = command.expected_replies();
            self.send(&command.into_inner()).await?;
            for _ in 0..expected {
                last_reply = Some(self.recv_and_handle_stop().await?);
            }
        }
        Ok(last_reply)
    }

    pub async fn run_command(&mut self, command: Command) -> Result<Option<InboundCommand>> {
        let generic = GenericCommand::new(command)?;
        self.run_commands(vec![generic]).await
    }

    /// Closes the connection and drains any already-buffered frames. A
    /// non-null drained frame is fatal unless `ignore_extra_commands` is
    /// set, per §4.9. A no-op if already terminated (idempotence, §8).
    pub async fn shutdown(&mut self, ignore_extra_commands: bool) -> Result<()> {
        if self.state_machine.state().is_terminated() {
            return Ok(());
        }
        while let Some(reply) = self.try_recv_one().await {
            if !ignore_extra_commands {
                self.kill().await;
                return Err(VmControllerError::ProtocolViolation {
                    expected: "no further frames during shutdown".into(),
                    found: format!("{reply:?}"),
                });
            }
        }
        let _ = self.framed.get_mut().shutdown().await;
        self.state_machine.on_shutdown_complete();
        Ok(())
    }

    /// Marks the session terminated unconditionally and closes the
    /// connection. Never fails; calling it twice is a no-op (§8).
    pub async fn kill(&mut self) {
        if self.state_machine.state().is_terminated() {
            return;
        }
        self.state_machine.force_terminated();
        self.sentinel_materialized = true;
        let _ = self.framed.get_mut().shutdown().await;
        self.listeners.terminated();
    }
}
