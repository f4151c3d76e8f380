//! Tokio codec for cabinet packet framing.
//!
//! `CabinetCodec` implements [`Decoder`] and [`Encoder<Packet>`] so a serial
//! stream can be wrapped in `Framed`, or driven by hand over a [`BytesMut`]
//! read buffer as the serial transport does.
//!
//! # Resynchronisation
//!
//! Serial lines pick up noise when a cabinet is power-cycled or the USB
//! bridge is re-plugged. The decoder discards bytes until it sees STX, and a
//! candidate header whose offset 6 is not ETX costs exactly one byte before
//! the scan resumes. A frame that passes framing but fails [`validate`] is
//! consumed and returned as an error, so the next call starts on fresh bytes.
//!
//! ```text
//! FF FF 02 00 00 80 10 02 03 9C 05 00
//! ^^^^^ dropped
//!       ^^^^^^^^^^^^^^^^^^^^^^^^^^^^^ one Packet
//! ```
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use tokio_util::codec::{Decoder, Encoder};
//! use medcab_protocol::{CabinetCodec, Packet};
//!
//! let mut codec = CabinetCodec::new();
//! let mut buffer = BytesMut::new();
//! codec.encode(Packet::status_request(0), &mut buffer).unwrap();
//!
//! let decoded = codec.decode(&mut buffer).unwrap().unwrap();
//! assert_eq!(decoded.command, 0x80);
//! assert!(buffer.is_empty());
//! ```

use bytes::{Buf, BytesMut};
use medcab_core::{
    Error, Result,
    constants::{ETX, HEADER_LEN, OFFSET_DATA_LEN, OFFSET_ETX, STX},
};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

use crate::packet::{Packet, hex_dump, is_complete_frame, validate};

/// Codec for DS12/DS16 packets.
#[derive(Debug, Default, Clone, Copy)]
pub struct CabinetCodec {
    discarded: usize,
}

impl CabinetCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes dropped while hunting for a frame start since construction.
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    fn discard(&mut self, src: &mut BytesMut, count: usize) {
        trace!(bytes = %hex_dump(&src[..count]), "Discarding unframed bytes");
        src.advance(count);
        self.discarded += count;
    }
}

impl Decoder for CabinetCodec {
    type Item = Packet;
    type Error = Error;

    /// Extract the next packet from `src`.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(Packet))` - a complete, valid frame was consumed
    /// - `Ok(None)` - more bytes are needed
    ///
    /// # Errors
    ///
    /// Returns the [`validate`] error for a complete frame with a bad
    /// checksum. The frame's bytes are consumed either way.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match src.iter().position(|b| *b == STX) {
                Some(0) => {}
                Some(offset) => self.discard(src, offset),
                None => {
                    if !src.is_empty() {
                        let len = src.len();
                        self.discard(src, len);
                    }
                    return Ok(None);
                }
            }

            if src.len() < HEADER_LEN {
                return Ok(None);
            }

            if src[OFFSET_ETX] != ETX {
                // STX inside noise or data, not a header.
                self.discard(src, 1);
                continue;
            }

            if !is_complete_frame(src) {
                let needed = HEADER_LEN + src[OFFSET_DATA_LEN] as usize;
                src.reserve(needed - src.len());
                return Ok(None);
            }

            let len = HEADER_LEN + src[OFFSET_DATA_LEN] as usize;
            let frame = src.split_to(len);
            trace!(bytes = %hex_dump(&frame), "Frame received");

            return match validate(&frame) {
                Ok(packet) => Ok(Some(packet)),
                Err(e) => {
                    debug!(error = %e, "Dropping invalid frame");
                    Err(e)
                }
            };
        }
    }
}

impl Encoder<Packet> for CabinetCodec {
    type Error = Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        item.encode_into(dst);
        Ok(())
    }
}

impl Encoder<&Packet> for CabinetCodec {
    type Error = Error;

    fn encode(&mut self, item: &Packet, dst: &mut BytesMut) -> Result<()> {
        item.encode_into(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS_REPLY: &[u8] = &[0x02, 0x00, 0x00, 0x80, 0x10, 0x02, 0x03, 0x9C, 0x05, 0x00];

    #[test]
    fn test_decode_complete_frame() {
        let mut codec = CabinetCodec::new();
        let mut buffer = BytesMut::from(STATUS_REPLY);

        let packet = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(packet.command, 0x80);
        assert_eq!(packet.ask, 0x10);
        assert_eq!(packet.data, vec![0x05, 0x00]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_decode_partial_frame() {
        let mut codec = CabinetCodec::new();
        let mut buffer = BytesMut::from(&STATUS_REPLY[..9]);

        assert!(codec.decode(&mut buffer).unwrap().is_none());
        assert_eq!(buffer.len(), 9);

        buffer.extend_from_slice(&STATUS_REPLY[9..]);
        assert!(codec.decode(&mut buffer).unwrap().is_some());
    }

    #[test]
    fn test_decode_empty_buffer() {
        let mut codec = CabinetCodec::new();
        let mut buffer = BytesMut::new();
        assert!(codec.decode(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn test_decode_skips_leading_garbage() {
        let mut codec = CabinetCodec::new();
        let mut buffer = BytesMut::from(&[0xFF, 0x00, 0x7E][..]);
        buffer.extend_from_slice(STATUS_REPLY);

        let packet = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(packet.data, vec![0x05, 0x00]);
        assert_eq!(codec.discarded(), 3);
    }

    #[test]
    fn test_decode_drops_garbage_without_stx() {
        let mut codec = CabinetCodec::new();
        let mut buffer = BytesMut::from(&[0x11, 0x22, 0x33][..]);

        assert!(codec.decode(&mut buffer).unwrap().is_none());
        assert!(buffer.is_empty());
        assert_eq!(codec.discarded(), 3);
    }

    #[test]
    fn test_decode_resyncs_on_false_stx() {
        let mut codec = CabinetCodec::new();
        // A stray STX whose offset 6 is not ETX.
        let mut buffer = BytesMut::from(&[0x02, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55][..]);
        buffer.extend_from_slice(STATUS_REPLY);

        let packet = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(packet.command, 0x80);
        assert_eq!(codec.discarded(), 7);
    }

    #[test]
    fn test_decode_checksum_error_consumes_frame() {
        let mut codec = CabinetCodec::new();
        let mut corrupted = STATUS_REPLY.to_vec();
        corrupted[7] = 0x95;
        let mut buffer = BytesMut::from(&corrupted[..]);
        buffer.extend_from_slice(STATUS_REPLY);

        assert!(matches!(
            codec.decode(&mut buffer),
            Err(Error::ChecksumMismatch { .. })
        ));
        assert_eq!(buffer.len(), STATUS_REPLY.len());
        assert!(codec.decode(&mut buffer).unwrap().is_some());
    }

    #[test]
    fn test_decode_multiple_frames_in_buffer() {
        let mut codec = CabinetCodec::new();
        let mut buffer = BytesMut::new();
        codec.encode(Packet::status_request(0), &mut buffer).unwrap();
        codec.encode(&Packet::version_request(0), &mut buffer).unwrap();

        assert_eq!(codec.decode(&mut buffer).unwrap().unwrap().command, 0x80);
        assert_eq!(codec.decode(&mut buffer).unwrap().unwrap().command, 0x8F);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
    }
}
