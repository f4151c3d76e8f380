//! Binary packet framing and checksum for the cabinet wire protocol.
//!
//! Every packet is an 8-byte header followed by `DATALEN` data bytes. The
//! checksum at offset 7 is the modulo-256 **sum** of every other byte in the
//! packet, header and data alike.
//!
//! ```text
//! 02 00 00 80 00 00 03 85            status request
//! 02 00 00 81 00 01 03 89 02         unlock slot 3 (index 2)
//! 02 00 00 80 10 02 03 9C 05 00      status reply, slots 1 and 3 open
//! ```
//!
//! # Example
//!
//! ```
//! use medcab_protocol::{CommandCode, build, validate};
//!
//! let bytes = build(CommandCode::Unlock, &[2]).unwrap();
//! assert_eq!(&bytes[..], &[0x02, 0x00, 0x00, 0x81, 0x00, 0x01, 0x03, 0x89, 0x02]);
//!
//! let packet = validate(&bytes).unwrap();
//! assert_eq!(packet.command, 0x81);
//! assert_eq!(packet.data, vec![2]);
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use medcab_core::{
    AskCode, Error, Result, SlotId,
    constants::{
        ASK_REQUEST, DEFAULT_ADDRESS, DEFAULT_LOCK_NUM, ETX, HEADER_LEN, MAX_DATA_LEN,
        OFFSET_ADDR, OFFSET_ASK, OFFSET_CHECKSUM, OFFSET_CMD, OFFSET_DATA, OFFSET_DATA_LEN,
        OFFSET_ETX, OFFSET_LOCK_NUM, OFFSET_STX, STX,
    },
};
use std::fmt::Write as _;

use crate::CommandCode;

/// A decoded packet, without the framing bytes that are implied by the layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub address: u8,
    pub lock_num: u8,
    pub command: u8,
    pub ask: u8,
    pub data: Vec<u8>,
}

impl Packet {
    /// Create a request packet (ASK = 0x00).
    ///
    /// # Errors
    /// Returns `Error::Config` if `data` does not fit the one-byte length field.
    pub fn request(address: u8, command: CommandCode, data: &[u8]) -> Result<Self> {
        Self::with_ask(address, command.to_u8(), ASK_REQUEST, data)
    }

    /// Create a response packet as the firmware would emit it.
    ///
    /// # Errors
    /// Returns `Error::Config` if `data` does not fit the one-byte length field.
    pub fn response(address: u8, command: u8, ask: AskCode, data: &[u8]) -> Result<Self> {
        Self::with_ask(address, command, ask.to_u8(), data)
    }

    fn with_ask(address: u8, command: u8, ask: u8, data: &[u8]) -> Result<Self> {
        if data.len() > MAX_DATA_LEN {
            return Err(Error::Config(format!(
                "packet data of {} bytes exceeds {MAX_DATA_LEN}",
                data.len()
            )));
        }
        Ok(Self {
            address,
            lock_num: DEFAULT_LOCK_NUM,
            command,
            ask,
            data: data.to_vec(),
        })
    }

    /// `0x80` slot state request.
    pub fn status_request(address: u8) -> Self {
        Self::header_only(address, CommandCode::Status)
    }

    /// `0x81` unlock request for one slot.
    pub fn unlock_request(address: u8, slot: SlotId) -> Self {
        Self {
            data: vec![slot.zero_based()],
            ..Self::header_only(address, CommandCode::Unlock)
        }
    }

    /// `0x8F` firmware version request.
    pub fn version_request(address: u8) -> Self {
        Self::header_only(address, CommandCode::Version)
    }

    fn header_only(address: u8, command: CommandCode) -> Self {
        Self {
            address,
            lock_num: DEFAULT_LOCK_NUM,
            command: command.to_u8(),
            ask: ASK_REQUEST,
            data: Vec::new(),
        }
    }

    /// Set the lock group byte
    pub fn lock_num(mut self, lock_num: u8) -> Self {
        self.lock_num = lock_num;
        self
    }

    /// The typed command, if the CMD byte is a known one.
    pub fn command_code(&self) -> Result<CommandCode> {
        CommandCode::from_u8(self.command)
    }

    /// The typed ASK code. Fails for requests (ASK 0x00) and unknown codes.
    pub fn ask_code(&self) -> Result<AskCode> {
        AskCode::from_u8(self.ask)
    }

    #[inline]
    pub fn data_len(&self) -> u8 {
        // Constructors cap data at MAX_DATA_LEN.
        self.data.len().min(MAX_DATA_LEN) as u8
    }

    /// Total number of bytes on the wire.
    #[inline]
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.data_len() as usize
    }

    /// Checksum this packet carries on the wire.
    pub fn checksum(&self) -> u8 {
        let header = checksum(&[
            STX,
            self.address,
            self.lock_num,
            self.command,
            self.ask,
            self.data_len(),
            ETX,
        ]);
        header.wrapping_add(checksum(self.payload()))
    }

    fn payload(&self) -> &[u8] {
        &self.data[..self.data_len() as usize]
    }

    /// Append the wire form of this packet to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.wire_len());
        dst.put_u8(STX);
        dst.put_u8(self.address);
        dst.put_u8(self.lock_num);
        dst.put_u8(self.command);
        dst.put_u8(self.ask);
        dst.put_u8(self.data_len());
        dst.put_u8(ETX);
        dst.put_u8(self.checksum());
        dst.put_slice(self.payload());
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }
}

/// Modulo-256 sum of `bytes`.
///
/// The firmware rejects XOR checksums; the byte must be the wrapping sum.
///
/// ```
/// use medcab_protocol::checksum;
///
/// assert_eq!(checksum(&[0x02, 0x00, 0x00, 0x80, 0x00, 0x00, 0x03]), 0x85);
/// ```
#[inline]
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Build the wire bytes of a request to the default address.
///
/// # Errors
/// Returns `Error::Config` if `data` is longer than 255 bytes.
pub fn build(command: CommandCode, data: &[u8]) -> Result<Bytes> {
    Ok(Packet::request(DEFAULT_ADDRESS, command, data)?.to_bytes())
}

/// Validate one complete frame and decode it.
///
/// # Errors
///
/// - `Error::InvalidResponse` if the frame is shorter than the header, does
///   not start with STX, has no ETX at offset 6, or its DATALEN disagrees with
///   the number of trailing bytes
/// - `Error::ChecksumMismatch` if the checksum byte is not the sum of the rest
pub fn validate(bytes: &[u8]) -> Result<Packet> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::invalid_response(format!(
            "frame too short: {} bytes, header is {HEADER_LEN}",
            bytes.len()
        )));
    }
    if bytes[OFFSET_STX] != STX {
        return Err(Error::invalid_response(format!(
            "expected STX at offset 0, found 0x{:02X}",
            bytes[OFFSET_STX]
        )));
    }
    if bytes[OFFSET_ETX] != ETX {
        return Err(Error::invalid_response(format!(
            "expected ETX at offset {OFFSET_ETX}, found 0x{:02X}",
            bytes[OFFSET_ETX]
        )));
    }

    let data_len = bytes[OFFSET_DATA_LEN] as usize;
    let trailing = bytes.len() - HEADER_LEN;
    if trailing != data_len {
        return Err(Error::invalid_response(format!(
            "DATALEN declares {data_len} bytes but {trailing} follow the header"
        )));
    }

    let actual = bytes[OFFSET_CHECKSUM];
    let expected =
        checksum(&bytes[..OFFSET_CHECKSUM]).wrapping_add(checksum(&bytes[OFFSET_DATA..]));
    if expected != actual {
        return Err(Error::ChecksumMismatch { expected, actual });
    }

    Ok(Packet {
        address: bytes[OFFSET_ADDR],
        lock_num: bytes[OFFSET_LOCK_NUM],
        command: bytes[OFFSET_CMD],
        ask: bytes[OFFSET_ASK],
        data: bytes[OFFSET_DATA..].to_vec(),
    })
}

/// Whether `buffer` starts with a frame whose every byte has arrived.
///
/// The ETX marker is checked at its fixed header offset. Bytes beyond the
/// frame are allowed; the caller splits them off.
pub fn is_complete_frame(buffer: &[u8]) -> bool {
    buffer.len() >= HEADER_LEN
        && buffer[OFFSET_STX] == STX
        && buffer[OFFSET_ETX] == ETX
        && buffer.len() >= HEADER_LEN + buffer[OFFSET_DATA_LEN] as usize
}

/// Space-separated uppercase hex, for trace logs.
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{b:02X}");
    }
    out
}
