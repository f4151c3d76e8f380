//! Access to operating-system serial ports.
//!
//! The [`SerialBackend`] trait is the seam between the cabinet logic and the
//! OS. [`SystemSerial`] talks to real ports through `serialport` and
//! `tokio-serial`; [`MockBackend`](crate::MockBackend) serves simulated
//! cabinets over in-memory pipes.

use medcab_core::{Error, Result};
use serde::Serialize;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, StopBits};
use tracing::debug;

/// Bus a port is attached through, as reported by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    Usb,
    Pci,
    Bluetooth,
    Unknown,
}

/// One entry of an OS port enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortInfo {
    pub path: String,
    pub kind: PortKind,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

impl PortInfo {
    /// A port with no USB descriptor.
    pub fn new(path: impl Into<String>, kind: PortKind) -> Self {
        Self {
            path: path.into(),
            kind,
            vendor_id: None,
            product_id: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }

    /// A USB port with the given vendor and product ids.
    pub fn usb(path: impl Into<String>, vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id: Some(vendor_id),
            product_id: Some(product_id),
            ..Self::new(path, PortKind::Usb)
        }
    }

    /// Set the manufacturer string
    pub fn manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    /// Set the product string
    pub fn product(mut self, product: impl Into<String>) -> Self {
        self.product = Some(product.into());
        self
    }
}

impl From<serialport::SerialPortInfo> for PortInfo {
    fn from(info: serialport::SerialPortInfo) -> Self {
        match info.port_type {
            serialport::SerialPortType::UsbPort(usb) => PortInfo {
                path: info.port_name,
                kind: PortKind::Usb,
                vendor_id: Some(usb.vid),
                product_id: Some(usb.pid),
                manufacturer: usb.manufacturer,
                product: usb.product,
                serial_number: usb.serial_number,
            },
            serialport::SerialPortType::PciPort => PortInfo::new(info.port_name, PortKind::Pci),
            serialport::SerialPortType::BluetoothPort => {
                PortInfo::new(info.port_name, PortKind::Bluetooth)
            }
            serialport::SerialPortType::Unknown => PortInfo::new(info.port_name, PortKind::Unknown),
        }
    }
}

/// Source of serial ports.
///
/// Implementations open ports at 8 data bits, no parity, one stop bit and no
/// flow control. Only the baud rate varies.
pub trait SerialBackend {
    /// Byte stream of an open port.
    type Port: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Enumerate ports currently present. Never cached.
    fn available_ports(&self) -> Result<Vec<PortInfo>>;

    /// Open `path` at `baud_rate`.
    ///
    /// # Errors
    ///
    /// - `Error::PortNotFound` if the path does not exist
    /// - `Error::ConnectionFailed` for any other OS-level failure
    fn open(&self, path: &str, baud_rate: u32) -> Result<Self::Port>;

    /// Open and immediately close `path`, without exchanging a command.
    fn probe(&self, path: &str, baud_rate: u32, _timeout: Duration) -> Result<()> {
        self.open(path, baud_rate).map(drop)
    }
}

/// Real serial ports.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSerial;

impl SystemSerial {
    pub fn new() -> Self {
        Self
    }
}

fn map_open_error(path: &str, error: serialport::Error) -> Error {
    match error.kind() {
        serialport::ErrorKind::NoDevice
        | serialport::ErrorKind::Io(io::ErrorKind::NotFound) => Error::PortNotFound {
            path: path.to_string(),
        },
        _ => Error::connection_failed(path, error),
    }
}

impl SerialBackend for SystemSerial {
    type Port = tokio_serial::SerialStream;

    fn available_ports(&self) -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports().map_err(io::Error::from)?;
        debug!(count = ports.len(), "Enumerated serial ports");
        Ok(ports.into_iter().map(PortInfo::from).collect())
    }

    fn open(&self, path: &str, baud_rate: u32) -> Result<Self::Port> {
        if path.is_empty() {
            return Err(Error::PortNotFound {
                path: String::new(),
            });
        }
        tokio_serial::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|e| map_open_error(path, e))
    }

    fn probe(&self, path: &str, baud_rate: u32, timeout: Duration) -> Result<()> {
        serialport::new(path, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(timeout)
            .open()
            .map(drop)
            .map_err(|e| map_open_error(path, e))
    }
}
