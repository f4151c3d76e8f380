//! Command codes understood by the DS12/DS16 controller firmware.
//!
//! The CMD byte sits at offset 3 of every packet. Responses echo the command
//! of the request they answer, which is the only correlation the wire
//! protocol offers.
//!
//! ```
//! use medcab_protocol::CommandCode;
//!
//! let cmd = CommandCode::from_u8(0x81).unwrap();
//! assert_eq!(cmd, CommandCode::Unlock);
//! assert_eq!(cmd.to_u8(), 0x81);
//! assert!(CommandCode::from_u8(0x42).is_err());
//! ```

use medcab_core::{
    Error, Result,
    constants::{CMD_STATUS, CMD_UNLOCK, CMD_VERSION},
};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CommandCode {
    /// Slot bitmask request, no data
    Status = CMD_STATUS,
    /// Unlock one slot, data is the zero-based slot index
    Unlock = CMD_UNLOCK,
    /// Firmware version request, no data
    Version = CMD_VERSION,
}

impl CommandCode {
    /// # Errors
    /// Returns `Error::InvalidResponse` for bytes that are not a known command.
    pub fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            CMD_STATUS => Ok(CommandCode::Status),
            CMD_UNLOCK => Ok(CommandCode::Unlock),
            CMD_VERSION => Ok(CommandCode::Version),
            other => Err(Error::invalid_response(format!(
                "unknown command 0x{other:02X}"
            ))),
        }
    }

    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Number of data bytes a request for this command carries.
    #[inline]
    pub fn request_data_len(self) -> usize {
        match self {
            CommandCode::Unlock => 1,
            CommandCode::Status | CommandCode::Version => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandCode::Status => "STATUS",
            CommandCode::Unlock => "UNLOCK",
            CommandCode::Version => "VERSION",
        }
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.as_str(), self.to_u8())
    }
}

impl TryFrom<u8> for CommandCode {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self> {
        Self::from_u8(byte)
    }
}
