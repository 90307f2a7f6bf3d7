use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::VmControllerError;

/// Maximum payload size accepted from the wire. Guards against a corrupt or
/// hostile length prefix turning a single frame into an unbounded allocation.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// A decoded `(code, payload)` pair, before it has been interpreted as an
/// [`crate::wire::reply::InboundCommand`]. Kept distinct from the typed
/// inbound command so the codec layer never needs to know the command
/// vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub code: u8,
    pub payload: Bytes,
}

/// An already-serialized outbound command, ready to be length-prefixed and
/// written to the sink. [`crate::wire::command::Command::encode`] produces
/// these.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub code: u8,
    pub payload: Bytes,
}

/// Length-prefixed framing: a big-endian `u32` byte count covering `code`
/// plus `payload`, then the code byte, then the payload bytes. One codec
/// instance is shared by the encode and decode halves of a connection.
#[derive(Debug, Default)]
pub struct FrameCodec {
    next_len: Option<u32>,
}

impl Decoder for FrameCodec {
    type Item = RawFrame;
    type Error = VmControllerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawFrame>, VmControllerError> {
        let len = match self.next_len {
            Some(len) => len,
            None => {
                if src.len() < 4 {
                    src.reserve(4 - src.len());
                    return Ok(None);
                }
                let len = (&src[..4]).get_u32();
                if len == 0 {
                    return Err(VmControllerError::Decode(
                        "zero-length frame (missing code byte)".into(),
                    ));
                }
                if len > MAX_FRAME_LEN {
                    return Err(VmControllerError::Decode(format!(
                        "frame length {len} exceeds maximum {MAX_FRAME_LEN}"
                    )));
                }
                src.advance(4);
                self.next_len = Some(len);
                len
            }
        };

        if (src.len() as u64) < len as u64 {
            src.reserve(len as usize - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(len as usize);
        self.next_len = None;
        let code = frame.get_u8();
        Ok(Some(RawFrame {
            code,
            payload: frame.freeze(),
        }))
    }
}

impl Encoder<OutboundFrame> for FrameCodec {
    type Error = VmControllerError;

    fn encode(&mut self, item: OutboundFrame, dst: &mut BytesMut) -> Result<(), VmControllerError> {
        let len = 1u32
            .checked_add(item.payload.len() as u32)
            .ok_or_else(|| VmControllerError::Decode("outbound frame too large".into()))?;
        dst.reserve(4 + len as usize);
        dst.put_u32(len);
        dst.put_u8(item.code);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_exactly_what_was_encoded() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(
                OutboundFrame {
                    code: 0x42,
                    payload: Bytes::from_static(b"hello"),
                },
                &mut buf,
            )
            .unwrap();

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.code, 0x42);
        assert_eq!(&frame.payload[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_a_complete_frame() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(
                OutboundFrame {
                    code: 1,
                    payload: Bytes::from_static(b"0123456789"),
                },
                &mut buf,
            )
            .unwrap();

        let mut partial = buf.split_to(6);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame.code, 1);
        assert_eq!(&frame.payload[..], b"0123456789");
    }

    #[test]
    fn rejects_oversized_length_prefix() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_LEN + 1);
        assert!(codec.decode(&mut buf).is_err());
    }
}
