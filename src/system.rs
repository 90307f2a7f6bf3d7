use std::collections::HashMap;

/// Whether a function belongs to user-written source or to VM-internal
/// machinery. Drives [`crate::debug_state::BackTraceFrame::is_visible`]
/// together with the `show_internal_frames` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    User,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionRef {
    pub id: u64,
    pub name: String,
    pub kind: FunctionKind,
}

impl FunctionRef {
    /// The sentinel used when a back-trace frame references a function id
    /// the current system doesn't know about (§4.9 `MissingFunction`).
    pub fn missing(id: u64) -> FunctionRef {
        FunctionRef {
            id,
            name: "<missing function>".to_string(),
            kind: FunctionKind::Internal,
        }
    }
}

/// A precise location within a function's bytecode, used to detect whether
/// a step made progress (§4.9 `step`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation {
    pub function_id: u64,
    pub bytecode_pointer: u64,
}

/// Resolved result of [`Compiler::debug_info_for_position`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugInfo {
    pub function_id: u64,
    pub bytecode_index: u64,
}

/// The currently loaded/compiled system: everything the controller needs
/// to know about functions and classes without speaking the wire protocol.
/// An external collaborator per §1 — the incremental compiler owns the
/// real implementation; this crate only consumes the trait.
pub trait System {
    fn lookup_function(&self, id: u64) -> Option<FunctionRef>;
    fn functions_named(&self, name: &str) -> Vec<FunctionRef>;
    fn function_ids_by_name(&self) -> HashMap<String, u64>;
    fn class_ids_by_name(&self) -> HashMap<String, u64>;

    /// The next bytecode pointer within `function_id` that leaves
    /// `previous`, if any — the frame-local computation §4.9's
    /// source-level `step` loops on.
    fn next_step_target(&self, function_id: u64, previous: SourceLocation) -> Option<u64>;
}

/// Source-position <-> bytecode-index resolution; consumed only by
/// `setFileBreakpoint`, per §1.
pub trait Compiler {
    fn position_in_file(&self, uri: &str, line: u32, column: u32) -> Option<u64>;
    fn position_in_file_from_pattern(&self, uri: &str, line: u32, pattern: &str) -> Option<u64>;
    fn debug_info_for_position(
        &self,
        uri: &str,
        position: u64,
        system: &dyn System,
    ) -> Option<DebugInfo>;
}

/// One increment from the incremental compiler's delta producer (§1, `Delta`
/// in the glossary): an ordered command list to replay against the VM plus
/// the system snapshot that results once those commands land.
pub struct CompilationDelta {
    pub commands: Vec<crate::wire::GenericCommand>,
    pub system: Box<dyn System + Send>,
}

/// How `initialize` (§4.9) should bring up the id-translation layer and the
/// compiled system. Snapshot mode installs an [`crate::id_translator::IdOffsetMapping`]
/// and trusts the snapshot's own code; live-editing mode instead replays
/// deltas produced by the incremental compiler.
pub enum InitializeSystem {
    Snapshot {
        snapshot_location: std::path::PathBuf,
        system: Box<dyn System + Send>,
    },
    LiveEditing {
        deltas: Vec<CompilationDelta>,
    },
}
