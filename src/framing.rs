// Splits a TCP stream into game packets.
//
// Every frame is a 2-byte little-endian length that counts itself, followed by
// the (possibly enciphered) opcode and body.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const HEADER_LEN: usize = 2;
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, Default)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = usize::from(u16::from_le_bytes([src[0], src[1]]));
        if len < HEADER_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame length {} is smaller than its header", len),
            ));
        }
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }
        let mut frame = src.split_to(len);
        frame.advance(HEADER_LEN);
        Ok(Some(frame.freeze()))
    }
}

impl Encoder<Bytes> for PacketCodec {
    type Error = io::Error;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = body.len() + HEADER_LEN;
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("packet of {} bytes does not fit in a frame", body.len()),
            ));
        }
        dst.reserve(len);
        dst.put_u16_le(len as u16);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_frames_wait_for_more() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::from(&[0x05, 0x00, 0x01][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);

        buf.extend_from_slice(&[0x02, 0x03, 0x04, 0x00]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.as_ref(), &[0x01, 0x02, 0x03]);
        assert_eq!(buf.as_ref(), &[0x04, 0x00]);
    }

    #[test]
    fn test_encode_prepends_length() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(&[0xfe, 0x02, 0x00]), &mut buf).unwrap();
        assert_eq!(buf.as_ref(), &[0x05, 0x00, 0xfe, 0x02, 0x00]);
    }

    #[test]
    fn test_invalid_length() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::from(&[0x01, 0x00, 0xaa][..]);
        assert_eq!(codec.decode(&mut buf).unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        assert!(codec.encode(Bytes::from(vec![0u8; MAX_FRAME_LEN]), &mut buf).is_err());
    }
}
