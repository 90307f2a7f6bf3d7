/// A heap value read back from the VM, assembled from one or more frames
/// per §4.9's structured-object-read rules.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteValue {
    /// A primitive echoed directly by a `DartValue` frame.
    Primitive(String),
    /// An object instance: `class_id` plus its field values, in field
    /// order.
    Instance { class_id: u64, fields: Vec<RemoteValue> },
    /// An array/list, its elements in index order.
    Array { elements: Vec<RemoteValue> },
    /// Anything the VM sent that isn't one of the above; preserved rather
    /// than discarded so callers can still report what went wrong.
    Error(RemoteErrorObject),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteErrorObject {
    pub message: String,
}

impl RemoteValue {
    pub fn error(message: impl Into<String>) -> RemoteValue {
        RemoteValue::Error(RemoteErrorObject {
            message: message.into(),
        })
    }
}
