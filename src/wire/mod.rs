//! The binary wire protocol: frame codec (§4.1), command model (§4.2) and
//! inbound reply decoding (§3).

pub mod command;
pub mod frame;
pub mod reply;

pub use command::{Command, ExpectedReplies, GenericCommand, MapKind};
pub use frame::{FrameCodec, OutboundFrame, RawFrame};
pub use reply::InboundCommand;
