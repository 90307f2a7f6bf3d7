use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, VmControllerError};

/// Decoded form of the `<snapshot>.info.json` file described in §6. Carried
/// as plain `serde_json` data rather than anything fancier, since the file
/// is produced entirely by external tooling and is never emitted by this
/// crate.
#[derive(Debug, Clone, Deserialize)]
pub struct NameOffsetMapping {
    pub snapshot_hash: u64,
    pub function_offsets: HashMap<String, u64>,
    pub class_offsets: HashMap<String, u64>,
}

impl NameOffsetMapping {
    pub fn load(path: &Path) -> Result<NameOffsetMapping> {
        let text = std::fs::read_to_string(path)
            .map_err(|_| VmControllerError::InfoFileNotFound(path.to_path_buf()))?;
        serde_json::from_str(&text)
            .map_err(|e| VmControllerError::MalformedInfoFile(e.to_string()))
    }

    /// Default info path for a snapshot: the snapshot file's path with
    /// `.info.json` appended, per §6.
    pub fn default_path_for_snapshot(snapshot_location: &Path) -> PathBuf {
        let mut name = snapshot_location.as_os_str().to_owned();
        name.push(".info.json");
        PathBuf::from(name)
    }
}

/// Bidirectional mapping between VM-internal function/class ids and the
/// symbolic offsets resident in a loaded system snapshot. Built once during
/// `initialize` from a [`NameOffsetMapping`] plus the id assignments the
/// current compiled system gave each function/class name.
#[derive(Debug, Clone, Default)]
pub struct IdOffsetMapping {
    function_id_to_offset: HashMap<u64, u64>,
    offset_to_function_id: HashMap<u64, u64>,
    class_id_to_offset: HashMap<u64, u64>,
    offset_to_class_id: HashMap<u64, u64>,
}

impl IdOffsetMapping {
    /// Build the mapping by joining the info file's name -> offset tables
    /// with the compiled system's name -> id tables.
    pub fn build(
        info: &NameOffsetMapping,
        function_ids_by_name: &HashMap<String, u64>,
        class_ids_by_name: &HashMap<String, u64>,
    ) -> IdOffsetMapping {
        let mut mapping = IdOffsetMapping::default();
        for (name, offset) in &info.function_offsets {
            if let Some(&id) = function_ids_by_name.get(name) {
                mapping.function_id_to_offset.insert(id, *offset);
                mapping.offset_to_function_id.insert(*offset, id);
            }
        }
        for (name, offset) in &info.class_offsets {
            if let Some(&id) = class_ids_by_name.get(name) {
                mapping.class_id_to_offset.insert(id, *offset);
                mapping.offset_to_class_id.insert(*offset, id);
            }
        }
        mapping
    }

    fn function_id_to_wire(&self, id: u64) -> u64 {
        *self.function_id_to_offset.get(&id).unwrap_or(&id)
    }

    fn wire_to_function_id(&self, offset: u64) -> u64 {
        *self.offset_to_function_id.get(&offset).unwrap_or(&offset)
    }

    fn class_id_to_wire(&self, id: u64) -> u64 {
        *self.class_id_to_offset.get(&id).unwrap_or(&id)
    }

    fn wire_to_class_id(&self, offset: u64) -> u64 {
        *self.offset_to_class_id.get(&offset).unwrap_or(&offset)
    }
}

/// Switched at each translation call site rather than expressed as boxed
/// closures, per the design note on dynamic id translation: under snapshot
/// mode ids are translated through an [`IdOffsetMapping`]; otherwise the
/// translation is the identity function.
#[derive(Debug, Clone)]
pub enum IdTranslator {
    Identity,
    Offset(IdOffsetMapping),
}

impl IdTranslator {
    pub fn function_id_to_wire(&self, id: u64) -> u64 {
        match self {
            IdTranslator::Identity => id,
            IdTranslator::Offset(m) => m.function_id_to_wire(id),
        }
    }

    pub fn wire_to_function_id(&self, offset: u64) -> u64 {
        match self {
            IdTranslator::Identity => offset,
            IdTranslator::Offset(m) => m.wire_to_function_id(offset),
        }
    }

    pub fn class_id_to_wire(&self, id: u64) -> u64 {
        match self {
            IdTranslator::Identity => id,
            IdTranslator::Offset(m) => m.class_id_to_wire(id),
        }
    }

    pub fn wire_to_class_id(&self, offset: u64) -> u64 {
        match self {
            IdTranslator::Identity => offset,
            IdTranslator::Offset(m) => m.wire_to_class_id(offset),
        }
    }

    pub fn is_snapshot_mode(&self) -> bool {
        matches!(self, IdTranslator::Offset(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_translator_round_trips() {
        let t = IdTranslator::Identity;
        assert_eq!(t.function_id_to_wire(17), 17);
        assert_eq!(t.wire_to_function_id(17), 17);
    }

    #[test]
    fn offset_translator_maps_through_names() {
        let info = NameOffsetMapping {
            snapshot_hash: 1,
            function_offsets: [("main".to_string(), 0x1000)].into_iter().collect(),
            class_offsets: HashMap::new(),
        };
        let functions = [("main".to_string(), 42)].into_iter().collect();
        let mapping = IdOffsetMapping::build(&info, &functions, &HashMap::new());
        let t = IdTranslator::Offset(mapping);
        assert_eq!(t.function_id_to_wire(42), 0x1000);
        assert_eq!(t.wire_to_function_id(0x1000), 42);
    }
}
