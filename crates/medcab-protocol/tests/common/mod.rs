//! Shared helpers for the protocol integration tests.
//!
//! Replies are built the way the controller firmware builds them, through
//! [`Packet::response`], so tests exercise the same encoder as production.

#![allow(dead_code)]

use medcab_core::AskCode;
use medcab_protocol::{CabinetCodec, Packet};
use tokio::io::DuplexStream;
use tokio_util::codec::Framed;

/// Status reply with the given slots (1-based) open.
pub fn status_reply(open_slots: &[u8]) -> Packet {
    let mut mask = [0u8; 2];
    for slot in open_slots {
        let index = (*slot - 1) as usize;
        mask[index / 8] |= 1 << (index % 8);
    }
    Packet::response(0, 0x80, AskCode::Success, &mask).unwrap()
}

pub fn unlock_ack() -> Packet {
    Packet::response(0, 0x81, AskCode::Success, &[]).unwrap()
}

pub fn version_reply(version: &str) -> Packet {
    Packet::response(0, 0x8F, AskCode::Success, version.as_bytes()).unwrap()
}

/// Two framed ends of an in-memory byte pipe.
pub fn framed_pair(
    buffer_size: usize,
) -> (
    Framed<DuplexStream, CabinetCodec>,
    Framed<DuplexStream, CabinetCodec>,
) {
    let (host, device) = tokio::io::duplex(buffer_size);
    (
        Framed::new(host, CabinetCodec::new()),
        Framed::new(device, CabinetCodec::new()),
    )
}
