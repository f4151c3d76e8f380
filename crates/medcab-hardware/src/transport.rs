//! Request/response transport over one serial port.
//!
//! The wire protocol has no correlation id, so a port carries exactly one
//! command at a time: write a packet, read until one complete frame arrives
//! or the attempt times out. Concurrent callers queue on the port lock and
//! never interleave bytes.
//!
//! A reply that arrives after its attempt timed out is stale. Input already
//! waiting on the port is discarded before every write, and frames for a
//! different command are skipped while reading.
//!
//! # Ownership
//!
//! A transport is either [`Owned`] (it opened the port and may close it) or
//! [`Borrowed`] (it was handed a [`PortLease`] by an owner). Only
//! `SerialTransport<_, Owned>` has `disconnect`:
//!
//! ```compile_fail
//! # use medcab_core::{ConnectionConfig, DeviceKind};
//! # use medcab_hardware::{SerialTransport, Borrowed};
//! # use medcab_protocol::ResponseParser;
//! # async fn example(
//! #     borrowed: SerialTransport<tokio::io::DuplexStream, Borrowed>,
//! # ) {
//! let mut borrowed = borrowed;
//! borrowed.disconnect().await; // no such method for borrowers
//! # }
//! ```
//!
//! When the owner disconnects, every lease sees the port as closed and gets
//! `Error::NotConnected`.
//!
//! # Retry policy
//!
//! | Failure                         | Retried |
//! |---------------------------------|---------|
//! | no complete frame in `timeout`  | yes     |
//! | write or read I/O error         | yes     |
//! | checksum / framing error        | no      |
//! | ASK other than success          | no      |
//!
//! After `max_retries` attempts, separated by `retry_delay`, the caller gets
//! `Error::CommunicationTimeout`. The transport holds no failure state, so the
//! next command starts a fresh attempt sequence.

#![allow(async_fn_in_trait)]

use bytes::BytesMut;
use futures::FutureExt;
use medcab_core::{ConnectionConfig, Error, Result, constants::MAX_PACKET_LEN};
use medcab_protocol::{CabinetCodec, Packet, ParsedResponse, ResponseParser, hex_dump};
use serde::Serialize;
use std::io;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::codec::Decoder;
use tracing::{debug, error, info, trace, warn};

use crate::backend::SerialBackend;

/// Anything that can run one command exchange against a cabinet.
///
/// Implemented by [`SerialTransport`] for both handle kinds; the dispensing
/// controller is generic over it.
pub trait CommandChannel {
    async fn send_command(&self, packet: &Packet) -> Result<ParsedResponse>;

    fn is_connected(&self) -> bool;
}

/// Connection lifecycle. There is no automatic reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Closed,
    Opening,
    Open,
}

/// Marker: the transport opened the port and may close it.
#[derive(Debug)]
pub enum Owned {}

/// Marker: the transport uses a port another transport owns.
#[derive(Debug)]
pub enum Borrowed {}

#[derive(Debug)]
struct PortSlot<S> {
    path: String,
    io: Mutex<Option<S>>,
    open: AtomicBool,
}

impl<S> PortSlot<S> {
    fn new(path: String, io: S) -> Self {
        Self {
            path,
            io: Mutex::new(Some(io)),
            open: AtomicBool::new(true),
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

/// Shared access to a port owned by another transport. Cannot close it.
#[derive(Debug)]
pub struct PortLease<S> {
    slot: Arc<PortSlot<S>>,
}

impl<S> Clone for PortLease<S> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<S> PortLease<S> {
    pub fn path(&self) -> &str {
        &self.slot.path
    }

    /// Whether the owner still has the port open.
    pub fn is_open(&self) -> bool {
        self.slot.is_open()
    }
}

/// Serial transport for one cabinet connection.
///
/// # Example
///
/// ```no_run
/// use medcab_core::{ConnectionConfig, DeviceKind};
/// use medcab_hardware::{SerialTransport, SystemSerial};
/// use medcab_protocol::{Packet, ResponseParser};
///
/// # async fn example() -> medcab_core::Result<()> {
/// let config = ConnectionConfig::for_device(DeviceKind::Ds12, "/dev/ttyUSB0");
/// let mut transport = SerialTransport::new(config, ResponseParser::new(DeviceKind::Ds12));
///
/// transport.connect(&SystemSerial::new()).await?;
/// let response = transport.send_command(&Packet::status_request(0)).await?;
/// println!("{response:?}");
/// transport.disconnect().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SerialTransport<S, H = Owned> {
    config: ConnectionConfig,
    parser: ResponseParser,
    port: Option<Arc<PortSlot<S>>>,
    state: ConnectionState,
    _handle: PhantomData<H>,
}

impl<S> SerialTransport<S, Owned>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Create a closed transport.
    pub fn new(config: ConnectionConfig, parser: ResponseParser) -> Self {
        Self {
            config,
            parser,
            port: None,
            state: ConnectionState::Closed,
            _handle: PhantomData,
        }
    }

    /// Take ownership of an already open stream.
    pub fn from_port(config: ConnectionConfig, parser: ResponseParser, io: S) -> Self {
        let slot = PortSlot::new(config.port_path.clone(), io);
        Self {
            config,
            parser,
            port: Some(Arc::new(slot)),
            state: ConnectionState::Open,
            _handle: PhantomData,
        }
    }

    /// Open the configured port through `backend`.
    ///
    /// Does nothing if the port is already open.
    ///
    /// # Errors
    ///
    /// - `Error::PortNotFound` if the path does not exist
    /// - `Error::ConnectionFailed` on any other OS-level open failure
    pub async fn connect<B>(&mut self, backend: &B) -> Result<()>
    where
        B: SerialBackend<Port = S>,
    {
        if self.is_connected() {
            debug!(port = %self.config.port_path, "Already connected");
            return Ok(());
        }

        self.state = ConnectionState::Opening;
        info!(
            port = %self.config.port_path,
            baud = self.config.baud_rate,
            "Opening serial port"
        );

        match backend.open(&self.config.port_path, self.config.baud_rate) {
            Ok(io) => {
                let slot = PortSlot::new(self.config.port_path.clone(), io);
                self.port = Some(Arc::new(slot));
                self.state = ConnectionState::Open;
                info!(port = %self.config.port_path, "Serial port open");
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Closed;
                error!(port = %self.config.port_path, error = %e, "Failed to open serial port");
                Err(e)
            }
        }
    }

    /// Close the port. Safe to call more than once.
    ///
    /// Waits for an in-flight command to finish first.
    pub async fn disconnect(&mut self) {
        self.state = ConnectionState::Closed;
        let Some(slot) = self.port.take() else {
            return;
        };

        slot.open.store(false, Ordering::Release);
        let mut io = slot.io.lock().await;
        if let Some(mut stream) = io.take() {
            if let Err(e) = stream.shutdown().await {
                debug!(port = %slot.path, error = %e, "Error while closing port");
            }
            info!(port = %slot.path, "Serial port closed");
        }
    }

    /// Share the open port with a [`Borrowed`] transport.
    pub fn lend(&self) -> Option<PortLease<S>> {
        self.port
            .as_ref()
            .filter(|slot| slot.is_open())
            .map(|slot| PortLease {
                slot: Arc::clone(slot),
            })
    }
}

impl<S> SerialTransport<S, Borrowed>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Use a port owned elsewhere. The borrower can never close it.
    pub fn borrow(config: ConnectionConfig, parser: ResponseParser, lease: PortLease<S>) -> Self {
        let state = if lease.is_open() {
            ConnectionState::Open
        } else {
            ConnectionState::Closed
        };
        Self {
            config,
            parser,
            port: Some(lease.slot),
            state,
            _handle: PhantomData,
        }
    }

    /// Give the lease back, leaving the port open.
    pub fn release(mut self) -> Option<PortLease<S>> {
        self.port.take().map(|slot| PortLease { slot })
    }
}

impl<S, H> SerialTransport<S, H>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn parser(&self) -> &ResponseParser {
        &self.parser
    }

    pub fn state(&self) -> ConnectionState {
        match (&self.port, self.state) {
            (Some(slot), ConnectionState::Open) if slot.is_open() => ConnectionState::Open,
            (_, ConnectionState::Opening) => ConnectionState::Opening,
            _ => ConnectionState::Closed,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Send one command and wait for its reply.
    ///
    /// Holds the port for the whole exchange, retries included.
    ///
    /// # Errors
    ///
    /// - `Error::NotConnected` if the port is closed
    /// - `Error::CommunicationTimeout` once every attempt has failed
    /// - `Error::ChecksumMismatch` / `Error::InvalidResponse` for a corrupted
    ///   or malformed reply (not retried)
    /// - `Error::Hardware` if the firmware rejected the command
    pub async fn send_command(&self, packet: &Packet) -> Result<ParsedResponse> {
        let slot = self.port.as_ref().ok_or(Error::NotConnected)?;
        let mut guard = slot.io.lock().await;
        let io = match guard.as_mut() {
            Some(io) if slot.is_open() => io,
            _ => return Err(Error::NotConnected),
        };

        let request = packet.to_bytes();
        let attempts = self.config.attempts();
        let timeout = self.config.timeout();
        let mut codec = CabinetCodec::new();
        let mut buffer = BytesMut::with_capacity(MAX_PACKET_LEN);

        for attempt in 1..=attempts {
            trace!(port = %slot.path, attempt, bytes = %hex_dump(&request), "Sending frame");

            let result = tokio::time::timeout(
                timeout,
                exchange(io, &request, packet.command, &mut codec, &mut buffer),
            )
            .await
            .unwrap_or_else(|_| {
                Err(Error::CommunicationTimeout {
                    attempts: attempt,
                    timeout_ms: self.config.timeout_ms,
                })
            });

            match result {
                Ok(reply) => return self.accept(&reply),
                Err(e) if e.is_retryable() => {
                    warn!(
                        port = %slot.path,
                        command = format_args!("0x{:02X}", packet.command),
                        attempt,
                        attempts,
                        error = %e,
                        "Command attempt failed"
                    );
                }
                Err(e) => {
                    warn!(port = %slot.path, error = %e, "Command failed");
                    return Err(e);
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay()).await;
            }
        }

        error!(
            port = %slot.path,
            command = format_args!("0x{:02X}", packet.command),
            attempts,
            "No response from cabinet"
        );
        Err(Error::CommunicationTimeout {
            attempts,
            timeout_ms: self.config.timeout_ms,
        })
    }

    fn accept(&self, reply: &Packet) -> Result<ParsedResponse> {
        let parsed = self.parser.parse(reply);
        if let Err(e) = &parsed {
            warn!(error = %e, "Cabinet rejected command");
        }
        parsed
    }
}

/// One write and one complete reply to `command`. Unbounded; the caller
/// applies the timeout.
async fn exchange<S>(
    io: &mut S,
    request: &[u8],
    command: u8,
    codec: &mut CabinetCodec,
    buffer: &mut BytesMut,
) -> Result<Packet>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    discard_pending(io, buffer)?;
    io.write_all(request).await?;
    io.flush().await?;

    loop {
        if let Some(packet) = codec.decode(buffer)? {
            if packet.command == command {
                return Ok(packet);
            }
            debug!(
                command = format_args!("0x{:02X}", packet.command),
                expected = format_args!("0x{:02X}", command),
                "Skipping stale reply"
            );
            continue;
        }
        if io.read_buf(buffer).await? == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "serial port closed by peer",
            )));
        }
    }
}

/// Drop whatever is already readable on `io`, plus any partial frame left in
/// `buffer` by an abandoned attempt. Never waits for more input.
fn discard_pending<S>(io: &mut S, buffer: &mut BytesMut) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut stale = buffer.len();
    buffer.clear();
    while let Some(read) = io.read_buf(buffer).now_or_never() {
        match read? {
            0 => break,
            n => {
                stale += n;
                buffer.clear();
            }
        }
    }
    if stale > 0 {
        debug!(bytes = stale, "Discarded stale input");
    }
    Ok(())
}

impl<S, H> CommandChannel for SerialTransport<S, H>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_command(&self, packet: &Packet) -> Result<ParsedResponse> {
        SerialTransport::send_command(self, packet).await
    }

    fn is_connected(&self) -> bool {
        SerialTransport::is_connected(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medcab_core::{AskCode, DeviceKind};
    use std::time::Duration;
    use tokio::io::DuplexStream;

    fn config() -> ConnectionConfig {
        ConnectionConfig::for_device(DeviceKind::Ds12, "/dev/test")
            .timeout_ms(100)
            .max_retries(3)
            .retry_delay_ms(50)
    }

    fn transport(io: DuplexStream) -> SerialTransport<DuplexStream> {
        SerialTransport::from_port(config(), ResponseParser::new(DeviceKind::Ds12), io)
    }

    #[tokio::test]
    async fn test_new_transport_is_closed() {
        let t: SerialTransport<DuplexStream> =
            SerialTransport::new(config(), ResponseParser::new(DeviceKind::Ds12));
        assert_eq!(t.state(), ConnectionState::Closed);
        assert!(matches!(
            t.send_command(&Packet::status_request(0)).await,
            Err(Error::NotConnected)
        ));
        assert!(t.lend().is_none());
    }

    #[tokio::test]
    async fn test_single_exchange() {
        let (host, mut device) = tokio::io::duplex(256);
        let t = transport(host);

        let responder = tokio::spawn(async move {
            let mut request = [0u8; 8];
            device.read_exact(&mut request).await.unwrap();
            assert_eq!(request, [0x02, 0x00, 0x00, 0x8F, 0x00, 0x00, 0x03, 0x94]);
            let reply = Packet::response(0, 0x8F, AskCode::Success, b"V1").unwrap();
            device.write_all(&reply.to_bytes()).await.unwrap();
            device
        });

        let response = t.send_command(&Packet::version_request(0)).await.unwrap();
        assert_eq!(response, ParsedResponse::Version("V1".to_string()));
        drop(responder.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_exhausts_retries() {
        let (host, _device) = tokio::io::duplex(256);
        let t = transport(host);
        let started = tokio::time::Instant::now();

        let result = t.send_command(&Packet::status_request(0)).await;
        assert!(matches!(
            result,
            Err(Error::CommunicationTimeout {
                attempts: 3,
                timeout_ms: 100
            })
        ));
        // Three timeouts and two delays.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(400), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "{elapsed:?}");
        assert!(t.is_connected());
    }

    #[tokio::test]
    async fn test_reply_to_other_command_skipped() {
        let (host, mut device) = tokio::io::duplex(256);
        let t = transport(host);

        tokio::spawn(async move {
            let mut request = [0u8; 8];
            device.read_exact(&mut request).await.unwrap();
            let stale = Packet::response(0, 0x8F, AskCode::Success, b"V1").unwrap();
            let reply = Packet::response(0, 0x80, AskCode::Success, &[0b100, 0]).unwrap();
            device.write_all(&stale.to_bytes()).await.unwrap();
            device.write_all(&reply.to_bytes()).await.unwrap();
            device
        });

        let slots = t
            .send_command(&Packet::status_request(0))
            .await
            .unwrap()
            .into_slot_states()
            .unwrap();
        assert!(slots[2].is_open);
    }

    #[tokio::test]
    async fn test_pending_input_discarded_before_write() {
        let (host, mut device) = tokio::io::duplex(256);
        let t = transport(host);

        let late = Packet::response(0, 0x80, AskCode::Success, &[0xFF, 0x0F]).unwrap();
        device.write_all(&late.to_bytes()).await.unwrap();
        device.write_all(&[0x02, 0x00]).await.unwrap();
        tokio::task::yield_now().await;

        tokio::spawn(async move {
            let mut request = [0u8; 8];
            device.read_exact(&mut request).await.unwrap();
            let reply = Packet::response(0, 0x80, AskCode::Success, &[0, 0]).unwrap();
            device.write_all(&reply.to_bytes()).await.unwrap();
            device
        });

        let slots = t
            .send_command(&Packet::status_request(0))
            .await
            .unwrap()
            .into_slot_states()
            .unwrap();
        assert!(slots.iter().all(|s| !s.is_open));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (host, _device) = tokio::io::duplex(256);
        let mut t = transport(host);
        assert!(t.is_connected());

        t.disconnect().await;
        t.disconnect().await;
        assert_eq!(t.state(), ConnectionState::Closed);
        assert!(matches!(
            t.send_command(&Packet::status_request(0)).await,
            Err(Error::NotConnected)
        ));
    }
}
