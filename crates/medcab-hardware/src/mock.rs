//! Simulated cabinet firmware for testing and development.
//!
//! [`MockCabinet`] answers status, unlock and version requests over any
//! async byte stream, usually one end of a [`tokio::io::duplex`] pipe.
//! A [`MockCabinetHandle`] plays the operator and the faulty line: it closes
//! drawers, swallows or delays replies and corrupts checksums.
//!
//! # Examples
//!
//! ```
//! use medcab_core::{DeviceKind, ConnectionConfig};
//! use medcab_hardware::{MockCabinet, SerialTransport};
//! use medcab_protocol::{Packet, ResponseParser};
//!
//! #[tokio::main]
//! async fn main() -> medcab_core::Result<()> {
//!     let (cabinet, handle) = MockCabinet::new(DeviceKind::Ds12);
//!     handle.open_slot(4);
//!
//!     let transport = SerialTransport::from_port(
//!         ConnectionConfig::for_device(DeviceKind::Ds12, "mock"),
//!         ResponseParser::new(DeviceKind::Ds12),
//!         cabinet.connect(),
//!     );
//!
//!     let slots = transport
//!         .send_command(&Packet::status_request(0))
//!         .await?
//!         .into_slot_states()?;
//!     assert!(slots[3].is_open);
//!     Ok(())
//! }
//! ```

use bytes::BytesMut;
use medcab_core::{AskCode, DeviceKind, Error, Result};
use medcab_protocol::{CabinetCodec, CommandCode, Packet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Decoder;
use tracing::{debug, trace};

use crate::backend::{PortInfo, SerialBackend};

const PIPE_CAPACITY: usize = 1024;

/// Firmware version reported by default.
pub const DEFAULT_MOCK_VERSION: &str = "MOCK-1.0";

#[derive(Debug)]
struct CabinetState {
    kind: DeviceKind,
    open: Vec<bool>,
    /// Status replies each open drawer has been reported in.
    open_polls: Vec<u32>,
    close_after_polls: Option<u32>,
    drop_next: usize,
    delay_next: Option<Duration>,
    corrupt_next: bool,
    reject_unlock: bool,
    version: String,
    requests: usize,
}

impl CabinetState {
    fn new(kind: DeviceKind) -> Self {
        let slots = kind.slot_count() as usize;
        Self {
            kind,
            open: vec![false; slots],
            open_polls: vec![0; slots],
            close_after_polls: None,
            drop_next: 0,
            delay_next: None,
            corrupt_next: false,
            reject_unlock: false,
            version: DEFAULT_MOCK_VERSION.to_string(),
            requests: 0,
        }
    }

    fn set_open(&mut self, slot: u8, open: bool) {
        if let Some(index) = (slot as usize).checked_sub(1)
            && index < self.open.len()
        {
            self.open[index] = open;
            self.open_polls[index] = 0;
        }
    }

    fn status_mask(&mut self) -> Vec<u8> {
        let mut mask = vec![0u8; self.kind.status_bytes()];
        for index in 0..self.open.len() {
            if !self.open[index] {
                continue;
            }
            mask[index / 8] |= 1 << (index % 8);
            self.open_polls[index] += 1;
            if self
                .close_after_polls
                .is_some_and(|n| self.open_polls[index] >= n)
            {
                // Operator pushes the drawer shut after this reply.
                self.open[index] = false;
                self.open_polls[index] = 0;
            }
        }
        mask
    }

    fn respond(&mut self, request: &Packet) -> Option<Packet> {
        self.requests += 1;
        if self.drop_next > 0 {
            self.drop_next -= 1;
            debug!(command = request.command, "Mock cabinet dropping reply");
            return None;
        }

        let (ask, data) = match CommandCode::from_u8(request.command) {
            Ok(CommandCode::Status) => (AskCode::Success, self.status_mask()),
            Ok(CommandCode::Unlock) => match request.data.first() {
                Some(&index) if !self.reject_unlock && index < self.kind.usable_slots() => {
                    self.set_open(index + 1, true);
                    (AskCode::Success, Vec::new())
                }
                _ => (AskCode::Failed, Vec::new()),
            },
            Ok(CommandCode::Version) => (AskCode::Success, self.version.as_bytes().to_vec()),
            Err(_) => (AskCode::UnknownCommand, Vec::new()),
        };

        Packet::response(request.address, request.command, ask, &data).ok()
    }
}

fn lock(state: &Mutex<CabinetState>) -> MutexGuard<'_, CabinetState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A simulated DS12/DS16 controller.
#[derive(Debug, Clone)]
pub struct MockCabinet {
    state: Arc<Mutex<CabinetState>>,
}

impl MockCabinet {
    /// Create a cabinet with every drawer closed.
    ///
    /// Returns a tuple of (MockCabinet, MockCabinetHandle). The handle stays
    /// valid for every stream the cabinet serves.
    pub fn new(kind: DeviceKind) -> (Self, MockCabinetHandle) {
        let state = Arc::new(Mutex::new(CabinetState::new(kind)));
        let handle = MockCabinetHandle {
            state: Arc::clone(&state),
        };
        (Self { state }, handle)
    }

    /// Serve on a fresh in-memory pipe and return the host end.
    ///
    /// Must be called within a Tokio runtime.
    pub fn connect(&self) -> DuplexStream {
        let (host, device) = tokio::io::duplex(PIPE_CAPACITY);
        self.spawn(device);
        host
    }

    /// Serve requests arriving on `io` in a background task.
    pub fn spawn<T>(&self, io: T) -> JoinHandle<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let cabinet = self.clone();
        tokio::spawn(async move {
            if let Err(e) = cabinet.serve(io).await {
                debug!(error = %e, "Mock cabinet stopped");
            }
        })
    }

    /// Answer requests until the peer closes the stream.
    pub async fn serve<T>(&self, mut io: T) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let mut codec = CabinetCodec::new();
        let mut buffer = BytesMut::with_capacity(PIPE_CAPACITY);

        loop {
            let request = match codec.decode(&mut buffer) {
                Ok(Some(request)) => request,
                Ok(None) => {
                    if io.read_buf(&mut buffer).await? == 0 {
                        return Ok(());
                    }
                    continue;
                }
                Err(e) => {
                    // Real firmware stays silent on a corrupted request.
                    debug!(error = %e, "Mock cabinet ignoring bad frame");
                    continue;
                }
            };

            let (reply, delay) = {
                let mut state = lock(&self.state);
                let reply = state.respond(&request).map(|reply| {
                    let mut bytes = reply.to_bytes().to_vec();
                    if std::mem::take(&mut state.corrupt_next) {
                        bytes[7] = bytes[7].wrapping_add(1);
                    }
                    bytes
                });
                let delay = match reply {
                    Some(_) => state.delay_next.take(),
                    None => None,
                };
                (reply, delay)
            };

            if let Some(delay) = delay {
                debug!(command = request.command, ?delay, "Mock cabinet delaying reply");
                tokio::time::sleep(delay).await;
            }
            if let Some(bytes) = reply {
                trace!(command = request.command, len = bytes.len(), "Mock cabinet reply");
                io.write_all(&bytes).await?;
                io.flush().await?;
            }
        }
    }
}

/// Control surface of a [`MockCabinet`].
#[derive(Debug, Clone)]
pub struct MockCabinetHandle {
    state: Arc<Mutex<CabinetState>>,
}

impl MockCabinetHandle {
    pub fn kind(&self) -> DeviceKind {
        lock(&self.state).kind
    }

    /// Open a drawer as if unlocked by hand.
    pub fn open_slot(&self, slot: u8) {
        lock(&self.state).set_open(slot, true);
    }

    /// Push a drawer shut (lock-back).
    pub fn close_slot(&self, slot: u8) {
        lock(&self.state).set_open(slot, false);
    }

    pub fn is_open(&self, slot: u8) -> bool {
        let state = lock(&self.state);
        (slot as usize)
            .checked_sub(1)
            .and_then(|i| state.open.get(i).copied())
            .unwrap_or(false)
    }

    /// Slots currently open, 1-based.
    pub fn open_slots(&self) -> Vec<u8> {
        let state = lock(&self.state);
        state
            .open
            .iter()
            .enumerate()
            .filter(|(_, open)| **open)
            .map(|(i, _)| i as u8 + 1)
            .collect()
    }

    /// Close each drawer automatically after it has shown open in `polls`
    /// status replies. `None` leaves drawers open until closed by hand.
    pub fn close_after_polls(&self, polls: Option<u32>) {
        lock(&self.state).close_after_polls = polls;
    }

    /// Swallow the next `count` replies.
    pub fn drop_next(&self, count: usize) {
        lock(&self.state).drop_next = count;
    }

    /// Hold the next reply back for `delay` before sending it.
    pub fn delay_next(&self, delay: Duration) {
        lock(&self.state).delay_next = Some(delay);
    }

    /// Send the next reply with a wrong checksum.
    pub fn corrupt_next(&self) {
        lock(&self.state).corrupt_next = true;
    }

    /// Answer unlock requests with `ASK_FAILED`.
    pub fn reject_unlock(&self, reject: bool) {
        lock(&self.state).reject_unlock = reject;
    }

    pub fn set_version(&self, version: impl Into<String>) {
        lock(&self.state).version = version.into();
    }

    /// Requests received, including ones whose reply was dropped.
    pub fn request_count(&self) -> usize {
        lock(&self.state).requests
    }
}

/// [`SerialBackend`] that serves a [`MockCabinet`] on listed paths.
#[derive(Debug, Clone)]
pub struct MockBackend {
    cabinet: MockCabinet,
    ports: Vec<PortInfo>,
}

impl MockBackend {
    /// Backend exposing one CH340 bridge at `/dev/ttyUSB0`.
    pub fn new(kind: DeviceKind) -> (Self, MockCabinetHandle) {
        let (cabinet, handle) = MockCabinet::new(kind);
        let ports = vec![
            PortInfo::usb("/dev/ttyUSB0", 0x1A86, 0x55D4)
                .manufacturer("QinHeng Electronics")
                .product("USB Serial"),
        ];
        (Self { cabinet, ports }, handle)
    }

    /// Replace the enumerated port list. The cabinet answers on every path.
    pub fn with_ports(mut self, ports: Vec<PortInfo>) -> Self {
        self.ports = ports;
        self
    }

    fn find(&self, path: &str) -> Result<&PortInfo> {
        self.ports
            .iter()
            .find(|p| p.path == path)
            .ok_or_else(|| Error::PortNotFound {
                path: path.to_string(),
            })
    }
}

impl SerialBackend for MockBackend {
    type Port = DuplexStream;

    fn available_ports(&self) -> Result<Vec<PortInfo>> {
        Ok(self.ports.clone())
    }

    fn open(&self, path: &str, baud_rate: u32) -> Result<Self::Port> {
        self.find(path)?;
        let expected = lock(&self.cabinet.state).kind.baud_rate();
        if baud_rate != expected {
            return Err(Error::connection_failed(
                path,
                format!("mock cabinet runs at {expected} baud, not {baud_rate}"),
            ));
        }
        Ok(self.cabinet.connect())
    }

    fn probe(&self, path: &str, _baud_rate: u32, _timeout: std::time::Duration) -> Result<()> {
        self.find(path).map(drop)
    }
}
