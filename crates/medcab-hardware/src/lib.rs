//! Serial hardware layer for DS12/DS16 cabinets.
//!
//! - [`backend`]: OS serial access behind the [`SerialBackend`] seam
//! - [`detector`]: USB-serial bridge discovery and scoring
//! - [`transport`]: one open port, one command in flight, timeout and retry
//! - [`mock`]: simulated cabinet firmware for tests and `--simulate`

pub mod backend;
pub mod detector;
pub mod mock;
pub mod transport;

pub use backend::{PortInfo, PortKind, SerialBackend, SystemSerial};
pub use detector::{Confidence, DetectedPort, PortDetector};
pub use mock::{MockBackend, MockCabinet, MockCabinetHandle};
pub use transport::{
    Borrowed, CommandChannel, ConnectionState, Owned, PortLease, SerialTransport,
};
