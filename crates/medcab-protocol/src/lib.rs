//! Wire protocol for DS12/DS16 medication-cabinet controllers.
//!
//! - [`packet`]: framing, checksum, `build` / `validate` / `is_complete_frame`
//! - [`codec`]: tokio-util codec with stream resynchronisation
//! - [`parser`]: typed decoding of replies

pub mod codec;
pub mod commands;
pub mod packet;
pub mod parser;

pub use codec::CabinetCodec;
pub use commands::CommandCode;
pub use packet::{Packet, build, checksum, hex_dump, is_complete_frame, validate};
pub use parser::{ParsedResponse, ResponseParser, decode_slot_states};
