//! Proto-level framing: the outermost 8-byte header shared by record,
//! info and admin exchanges.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::constants::{MAX_FRAME_SIZE, PROTO_HEADER_SIZE, PROTO_VERSION};
use crate::error::AerokvError;

/// One fully framed proto payload.
///
/// The 8-byte header is `version` in the high nibble of byte 0, the
/// payload type in byte 1, and a 48-bit big-endian payload length.
#[derive(Debug, Clone)]
pub struct ProtoFrame {
    /// Payload type: see [`crate::protocol::constants::msg_type`].
    pub msg_type: u8,
    /// Everything after the 8-byte header.
    pub payload: BytesMut,
}

impl ProtoFrame {
    /// Creates a frame with the given type and payload.
    pub fn new(msg_type: u8, payload: BytesMut) -> Self {
        Self { msg_type, payload }
    }

    /// Total bytes this frame occupies on the wire.
    pub fn wire_size(&self) -> usize {
        PROTO_HEADER_SIZE + self.payload.len()
    }
}

/// Stateless codec turning a byte stream into [`ProtoFrame`]s.
#[derive(Debug, Default)]
pub struct ProtoCodec;

impl ProtoCodec {
    /// Creates a new codec.
    pub fn new() -> Self {
        Self
    }
}

impl Encoder<ProtoFrame> for ProtoCodec {
    type Error = AerokvError;

    fn encode(&mut self, frame: ProtoFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = frame.payload.len();
        if len > MAX_FRAME_SIZE {
            return Err(AerokvError::Protocol(format!(
                "refusing to encode {} byte frame (limit {})",
                len, MAX_FRAME_SIZE
            )));
        }
        dst.reserve(frame.wire_size());
        dst.put_u8(PROTO_VERSION << 4);
        dst.put_u8(frame.msg_type);
        // 48-bit big-endian length.
        dst.put_u16((len >> 32) as u16);
        dst.put_u32(len as u32);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

impl Decoder for ProtoCodec {
    type Item = ProtoFrame;
    type Error = AerokvError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < PROTO_HEADER_SIZE {
            return Ok(None);
        }

        let version = src[0] >> 4;
        if version != PROTO_VERSION {
            return Err(AerokvError::Protocol(format!(
                "unsupported protocol version {}",
                version
            )));
        }
        let msg_type = src[1];
        let len = ((u64::from(src[2]) << 40)
            | (u64::from(src[3]) << 32)
            | (u64::from(src[4]) << 24)
            | (u64::from(src[5]) << 16)
            | (u64::from(src[6]) << 8)
            | u64::from(src[7])) as usize;

        if len > MAX_FRAME_SIZE {
            return Err(AerokvError::Protocol(format!(
                "refusing {} byte frame (limit {})",
                len, MAX_FRAME_SIZE
            )));
        }
        if src.len() < PROTO_HEADER_SIZE + len {
            src.reserve(PROTO_HEADER_SIZE + len - src.len());
            return Ok(None);
        }

        src.advance(PROTO_HEADER_SIZE);
        let payload = src.split_to(len);
        Ok(Some(ProtoFrame::new(msg_type, payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::msg_type;

    #[test]
    fn encode_decode_roundtrip() {
        let mut codec = ProtoCodec::new();
        let frame = ProtoFrame::new(msg_type::MESSAGE, BytesMut::from(&[1u8, 2, 3][..]));

        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        assert_eq!(buf.len(), PROTO_HEADER_SIZE + 3);
        assert_eq!(buf[0], 0x20);
        assert_eq!(buf[1], msg_type::MESSAGE);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.msg_type, msg_type::MESSAGE);
        assert_eq!(&decoded.payload[..], [1, 2, 3]);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_header() {
        let mut codec = ProtoCodec::new();
        let mut buf = BytesMut::from(&[0x20u8, 3][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn decode_waits_for_body() {
        let mut codec = ProtoCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u8(0x20);
        buf.put_u8(msg_type::INFO);
        buf.put_u16(0);
        buf.put_u32(10);
        buf.put_slice(&[0; 4]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_rejects_bad_version() {
        let mut codec = ProtoCodec::new();
        let mut buf = BytesMut::from(&[0x50u8, 3, 0, 0, 0, 0, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(AerokvError::Protocol(_))
        ));
    }

    #[test]
    fn oversized_frame_refused() {
        let mut codec = ProtoCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u8(0x20);
        buf.put_u8(msg_type::MESSAGE);
        buf.put_u16(0x7fff);
        buf.put_u32(0xffff_ffff);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(AerokvError::Protocol(_))
        ));
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let mut codec = ProtoCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(ProtoFrame::new(msg_type::INFO, BytesMut::from(&b"a"[..])), &mut buf)
            .unwrap();
        codec
            .encode(ProtoFrame::new(msg_type::INFO, BytesMut::from(&b"bc"[..])), &mut buf)
            .unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&first.payload[..], b"a");
        assert_eq!(&second.payload[..], b"bc");
    }
}
