//! Typed decoding of validated response packets.
//!
//! The parser looks at the ASK byte before anything else: a firmware
//! rejection is reported as [`Error::Hardware`] whatever command it answers.
//! Only successful replies are dispatched on CMD.
//!
//! # Slot bitmask
//!
//! Status replies carry one bit per slot, least significant bit first:
//!
//! ```text
//! byte 0  bit 0..7  slots 1..8
//! byte 1  bit 0..7  slots 9..16   (DS12 uses bits 0..3)
//! ```
//!
//! A set bit means the drawer is open.
//!
//! ```
//! use medcab_core::DeviceKind;
//! use medcab_protocol::{Packet, ParsedResponse, ResponseParser};
//! use medcab_core::AskCode;
//!
//! let reply = Packet::response(0, 0x80, AskCode::Success, &[0b0000_0101, 0x00]).unwrap();
//! let parser = ResponseParser::new(DeviceKind::Ds12);
//!
//! let ParsedResponse::Status(slots) = parser.parse(&reply).unwrap() else {
//!     panic!("expected a status reply");
//! };
//! assert_eq!(slots.len(), 12);
//! assert!(slots[0].is_open && slots[2].is_open);
//! assert!(!slots[1].is_open);
//! ```

use medcab_core::{AskCode, DeviceKind, Error, Result, SlotState};
use serde::Serialize;

use crate::{CommandCode, Packet};

/// Decoded payload of a successful reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ParsedResponse {
    /// `0x80`: state of every usable slot, slot 1 first
    Status(Vec<SlotState>),
    /// `0x81`: the controller accepted the unlock
    UnlockAck,
    /// `0x8F`: firmware version string
    Version(String),
}

impl ParsedResponse {
    pub fn command(&self) -> CommandCode {
        match self {
            ParsedResponse::Status(_) => CommandCode::Status,
            ParsedResponse::UnlockAck => CommandCode::Unlock,
            ParsedResponse::Version(_) => CommandCode::Version,
        }
    }

    /// # Errors
    /// Returns `Error::InvalidResponse` if this is not a status reply.
    pub fn into_slot_states(self) -> Result<Vec<SlotState>> {
        match self {
            ParsedResponse::Status(slots) => Ok(slots),
            other => Err(Error::invalid_response(format!(
                "expected a status reply, got {}",
                other.command()
            ))),
        }
    }

    /// # Errors
    /// Returns `Error::InvalidResponse` if this is not a version reply.
    pub fn into_version(self) -> Result<String> {
        match self {
            ParsedResponse::Version(version) => Ok(version),
            other => Err(Error::invalid_response(format!(
                "expected a version reply, got {}",
                other.command()
            ))),
        }
    }
}

/// Decodes replies for one device variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseParser {
    kind: DeviceKind,
}

impl ResponseParser {
    pub fn new(kind: DeviceKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// Decode a packet that already passed [`validate`](crate::validate).
    ///
    /// # Errors
    ///
    /// - `Error::Hardware` if ASK is any known code other than `ASK_SUCCESS`
    /// - `Error::InvalidResponse` for an unknown ASK byte, an unknown command,
    ///   or a status reply too short for the device's bitmask
    pub fn parse(&self, packet: &Packet) -> Result<ParsedResponse> {
        let ask = AskCode::from_u8(packet.ask)?;
        if !ask.is_success() {
            return Err(Error::Hardware {
                command: packet.command,
                ask,
            });
        }

        match packet.command_code()? {
            CommandCode::Status => Ok(ParsedResponse::Status(decode_slot_states(
                &packet.data,
                self.kind.usable_slots(),
            )?)),
            CommandCode::Unlock => Ok(ParsedResponse::UnlockAck),
            CommandCode::Version => Ok(ParsedResponse::Version(decode_version(&packet.data))),
        }
    }
}

/// Read `count` slot bits from a status bitmask.
///
/// # Errors
/// Returns `Error::InvalidResponse` if `data` holds fewer than `count` bits.
pub fn decode_slot_states(data: &[u8], count: u8) -> Result<Vec<SlotState>> {
    let needed = (count as usize).div_ceil(8);
    if data.len() < needed {
        return Err(Error::invalid_response(format!(
            "status reply has {} data bytes, {count} slots need {needed}",
            data.len()
        )));
    }

    Ok((0..count as usize)
        .map(|index| {
            let is_open = data[index / 8] & (1 << (index % 8)) != 0;
            SlotState::new(index as u8 + 1, is_open)
        })
        .collect())
}

fn decode_version(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use medcab_core::SlotStatus;
    use rstest::rstest;

    fn reply(command: u8, ask: AskCode, data: &[u8]) -> Packet {
        Packet::response(0, command, ask, data).unwrap()
    }

    #[test]
    fn test_ds12_bitmask_slots_one_and_three_open() {
        let slots = decode_slot_states(&[0b0000_0101, 0b0000], 12).unwrap();
        assert_eq!(slots.len(), 12);
        for slot in &slots {
            let expected = matches!(slot.slot_number, 1 | 3);
            assert_eq!(slot.is_open, expected, "slot {}", slot.slot_number);
        }
        assert_eq!(slots[0].status, SlotStatus::Open);
        assert_eq!(slots[1].status, SlotStatus::Closed);
    }

    #[rstest]
    #[case(&[0x00, 0x01], 9)]
    #[case(&[0x00, 0x08], 12)]
    #[case(&[0x80, 0x00], 8)]
    fn test_second_byte_maps_to_upper_slots(#[case] data: &[u8], #[case] open_slot: u8) {
        let slots = decode_slot_states(data, 12).unwrap();
        let open: Vec<u8> = slots
            .iter()
            .filter(|s| s.is_open)
            .map(|s| s.slot_number)
            .collect();
        assert_eq!(open, vec![open_slot]);
    }

    #[test]
    fn test_ds12_ignores_unused_high_bits() {
        let slots = decode_slot_states(&[0x00, 0xF0], 12).unwrap();
        assert!(slots.iter().all(|s| !s.is_open));
    }

    #[test]
    fn test_ds16_exposes_fifteen_slots() {
        let parser = ResponseParser::new(DeviceKind::Ds16);
        let response = parser
            .parse(&reply(0x80, AskCode::Success, &[0x00, 0xC0]))
            .unwrap();
        let slots = response.into_slot_states().unwrap();
        assert_eq!(slots.len(), 15);
        assert!(slots[14].is_open);
        assert!(slots[..14].iter().all(|s| !s.is_open));
    }

    #[test]
    fn test_short_status_reply() {
        let parser = ResponseParser::new(DeviceKind::Ds12);
        let err = parser
            .parse(&reply(0x80, AskCode::Success, &[0x01]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidResponse { .. }));
    }

    #[test]
    fn test_unlock_ack() {
        let parser = ResponseParser::new(DeviceKind::Ds12);
        assert_eq!(
            parser.parse(&reply(0x81, AskCode::Success, &[])).unwrap(),
            ParsedResponse::UnlockAck
        );
    }

    #[test]
    fn test_version_string() {
        let parser = ResponseParser::new(DeviceKind::Ds12);
        let response = parser
            .parse(&reply(0x8F, AskCode::Success, b"DS12-V1.2\0\0"))
            .unwrap();
        assert_eq!(response.into_version().unwrap(), "DS12-V1.2");
    }

    #[rstest]
    #[case(0x80, AskCode::Failed)]
    #[case(0x81, AskCode::Failed)]
    #[case(0x81, AskCode::Timeout)]
    #[case(0x8F, AskCode::UnknownCommand)]
    #[case(0x80, AskCode::DataVerificationFailed)]
    fn test_non_success_ask_short_circuits(#[case] command: u8, #[case] ask: AskCode) {
        let parser = ResponseParser::new(DeviceKind::Ds12);
        match parser.parse(&reply(command, ask, &[])) {
            Err(Error::Hardware { command: c, ask: a }) => {
                assert_eq!(c, command);
                assert_eq!(a, ask);
            }
            other => panic!("expected hardware error, got {other:?}"),
        }
    }

    #[test]
    fn test_failed_ask_wins_over_unknown_command() {
        let parser = ResponseParser::new(DeviceKind::Ds12);
        let err = parser
            .parse(&reply(0x42, AskCode::UnknownCommand, &[]))
            .unwrap_err();
        assert!(matches!(err, Error::Hardware { command: 0x42, .. }));
    }

    #[test]
    fn test_unknown_ask_byte() {
        let parser = ResponseParser::new(DeviceKind::Ds12);
        let mut packet = reply(0x80, AskCode::Success, &[0, 0]);
        packet.ask = 0x00;
        assert!(matches!(
            parser.parse(&packet),
            Err(Error::InvalidResponse { .. })
        ));
    }

    #[test]
    fn test_unknown_command_with_success() {
        let parser = ResponseParser::new(DeviceKind::Ds12);
        assert!(matches!(
            parser.parse(&reply(0x90, AskCode::Success, &[])),
            Err(Error::InvalidResponse { .. })
        ));
    }

    #[test]
    fn test_wrong_variant_accessors() {
        assert!(ParsedResponse::UnlockAck.into_slot_states().is_err());
        assert!(ParsedResponse::Status(Vec::new()).into_version().is_err());
    }
}
