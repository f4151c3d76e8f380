//! Property-based tests for packet building and validation.

mod common;

use medcab_core::AskCode;
use medcab_protocol::{
    CommandCode, Packet, build, checksum, decode_slot_states, is_complete_frame, validate,
};
use proptest::prelude::*;

fn command() -> impl Strategy<Value = CommandCode> {
    prop_oneof![
        Just(CommandCode::Status),
        Just(CommandCode::Unlock),
        Just(CommandCode::Version),
    ]
}

fn ask() -> impl Strategy<Value = AskCode> {
    prop_oneof![
        Just(AskCode::Success),
        Just(AskCode::Failed),
        Just(AskCode::Timeout),
        Just(AskCode::UnknownCommand),
        Just(AskCode::DataVerificationFailed),
    ]
}

proptest! {
    /// Property: validate(build(cmd, data)) recovers cmd and data.
    #[test]
    fn prop_build_validate_roundtrip(
        cmd in command(),
        data in prop::collection::vec(any::<u8>(), 0..=255),
    ) {
        let bytes = build(cmd, &data).unwrap();
        prop_assert_eq!(bytes.len(), 8 + data.len());
        prop_assert!(is_complete_frame(&bytes));

        let packet = validate(&bytes).unwrap();
        prop_assert_eq!(packet.command_code().unwrap(), cmd);
        prop_assert_eq!(packet.data, data);
    }

    /// Property: the checksum byte equals the wrapping sum of every other byte.
    #[test]
    fn prop_checksum_is_wrapping_sum(
        address in any::<u8>(),
        command in any::<u8>(),
        ask in ask(),
        data in prop::collection::vec(any::<u8>(), 0..32),
    ) {
        let bytes = Packet::response(address, command, ask, &data).unwrap().to_bytes();
        let mut others = bytes[..7].to_vec();
        others.extend_from_slice(&bytes[8..]);
        let expected = others.iter().map(|b| *b as u32).sum::<u32>() % 256;
        prop_assert_eq!(bytes[7] as u32, expected);
        prop_assert_eq!(checksum(&others), bytes[7]);
    }

    /// Property: flipping any single non-checksum byte makes validation fail.
    #[test]
    fn prop_single_byte_corruption_detected(
        cmd in command(),
        data in prop::collection::vec(any::<u8>(), 1..16),
        position in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let mut bytes = build(cmd, &data).unwrap().to_vec();
        let index = position.index(bytes.len());
        prop_assume!(index != 7);
        bytes[index] ^= flip;
        prop_assert!(validate(&bytes).is_err());
    }

    /// Property: a frame is never complete before its last byte arrives.
    #[test]
    fn prop_truncated_frame_incomplete(
        cmd in command(),
        data in prop::collection::vec(any::<u8>(), 0..16),
        cut in any::<prop::sample::Index>(),
    ) {
        let bytes = build(cmd, &data).unwrap();
        let len = cut.index(bytes.len());
        prop_assert!(!is_complete_frame(&bytes[..len]));
    }

    /// Property: slot n is open exactly when bit (n-1) of the mask is set.
    #[test]
    fn prop_bitmask_decoding(mask in any::<u16>(), count in 1u8..=16) {
        let bytes = mask.to_le_bytes();
        let slots = decode_slot_states(&bytes, count).unwrap();
        prop_assert_eq!(slots.len(), count as usize);
        for slot in slots {
            let bit = mask & (1 << (slot.slot_number - 1)) != 0;
            prop_assert_eq!(slot.is_open, bit);
        }
    }
}

#[test]
fn test_common_status_reply_helper() {
    let packet = common::status_reply(&[1, 3]);
    assert_eq!(packet.data, vec![0b0000_0101, 0x00]);
}
