//! Core constants for the DS12/DS16 cabinet controller protocol.
//!
//! This module defines the wire-level constants shared by the codec, the
//! serial transport and the dispensing state machine. Keeping them in one
//! place guarantees that every layer frames, checksums and times out the
//! same way.
//!
//! # Packet Structure
//!
//! Every packet, request or response, uses the same fixed header followed by
//! an optional data section:
//!
//! ```text
//! offset 0  STX       0x02
//! offset 1  ADDR      device address (0x00 default)
//! offset 2  LOCKNUM   reserved / lock group
//! offset 3  CMD       0x80 status, 0x81 unlock, 0x8F version
//! offset 4  ASK       0x00 on request, response code on reply
//! offset 5  DATALEN   number of trailing data bytes
//! offset 6  ETX       0x03
//! offset 7  CHECKSUM  sum of every other byte, mod 256
//! offset 8  DATA[DATALEN]
//! ```
//!
//! # Usage
//!
//! ```
//! use medcab_core::constants::*;
//!
//! assert_eq!(HEADER_LEN, 8);
//! assert_eq!(DS12_BAUD_RATE, 19_200);
//!
//! fn frame_len(data_len: u8) -> usize {
//!     HEADER_LEN + data_len as usize
//! }
//! assert_eq!(frame_len(2), 10);
//! ```

// ============================================================================
// Framing
// ============================================================================

/// Start-of-text marker, always the first byte of a packet.
pub const STX: u8 = 0x02;

/// End-of-text marker, always at [`OFFSET_ETX`].
pub const ETX: u8 = 0x03;

/// Default device address on the RS-485/USB bus.
pub const DEFAULT_ADDRESS: u8 = 0x00;

/// Default lock group for requests.
pub const DEFAULT_LOCK_NUM: u8 = 0x00;

/// ASK byte sent in every request.
pub const ASK_REQUEST: u8 = 0x00;

/// Size of the fixed header (STX through CHECKSUM).
pub const HEADER_LEN: usize = 8;

/// Largest data section a packet can declare (DATALEN is one byte).
pub const MAX_DATA_LEN: usize = u8::MAX as usize;

/// Largest possible packet on the wire.
pub const MAX_PACKET_LEN: usize = HEADER_LEN + MAX_DATA_LEN;

pub const OFFSET_STX: usize = 0;
pub const OFFSET_ADDR: usize = 1;
pub const OFFSET_LOCK_NUM: usize = 2;
pub const OFFSET_CMD: usize = 3;
pub const OFFSET_ASK: usize = 4;
pub const OFFSET_DATA_LEN: usize = 5;
pub const OFFSET_ETX: usize = 6;
pub const OFFSET_CHECKSUM: usize = 7;
pub const OFFSET_DATA: usize = 8;

// ============================================================================
// Commands
// ============================================================================

/// Request the open/closed bitmask of every slot.
pub const CMD_STATUS: u8 = 0x80;

/// Unlock one slot. Data is a single zero-based slot index.
pub const CMD_UNLOCK: u8 = 0x81;

/// Request the firmware version string.
pub const CMD_VERSION: u8 = 0x8F;

// ============================================================================
// ASK response codes
// ============================================================================

pub const ASK_SUCCESS: u8 = 0x10;
pub const ASK_FAILED: u8 = 0x11;
pub const ASK_TIMEOUT: u8 = 0x12;
pub const ASK_UNKNOWN_COMMAND: u8 = 0x13;
pub const ASK_DATA_VERIFICATION_FAILED: u8 = 0x14;

// ============================================================================
// Device variants
// ============================================================================

/// DS12 line speed (8-N-1, no flow control).
pub const DS12_BAUD_RATE: u32 = 19_200;

/// DS16 line speed (8-N-1, no flow control).
pub const DS16_BAUD_RATE: u32 = 38_400;

/// Slots reported by a DS12 status bitmask.
pub const DS12_SLOT_COUNT: u8 = 12;

/// Slots reported by a DS16 status bitmask.
pub const DS16_SLOT_COUNT: u8 = 16;

/// Slots a DS16 cabinet exposes to operators. The sixteenth bit is reserved.
pub const DS16_USABLE_SLOTS: u8 = 15;

// ============================================================================
// Timing
// ============================================================================

/// Default time to wait for a complete response frame (milliseconds).
pub const DEFAULT_TIMEOUT_MS: u64 = 3000;

/// Default number of attempts per command before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Fixed delay between attempts (milliseconds).
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;

/// Default timeout for a pre-flight port open (milliseconds).
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 2000;
