//! Serial port discovery for cabinet controllers.
//!
//! Cabinets connect through a USB-serial bridge. Ports are scored by how
//! closely their USB descriptor matches a bridge known to ship in DS12/DS16
//! enclosures:
//!
//! | Confidence | Rule |
//! |------------|------|
//! | `high`     | exact VID:PID of CH340, CP210x or FTDI FT232 |
//! | `medium`   | manufacturer or product string names a known bridge vendor |
//! | `low`      | USB port, or a path that looks like a USB/COM serial device |
//! | `unknown`  | anything else (onboard UARTs, Bluetooth) |
//!
//! Scans are never cached: drawers are serviced with the cabinet unplugged,
//! and a bridge may come back on a different path.
//!
//! # Example
//!
//! ```no_run
//! use medcab_core::DeviceKind;
//! use medcab_hardware::{PortDetector, SystemSerial};
//!
//! # fn example() -> medcab_core::Result<()> {
//! let detector = PortDetector::new(SystemSerial::new(), DeviceKind::Ds12);
//! if let Some(port) = detector.get_best_port()? {
//!     println!("{} ({}): {}", port.path, port.confidence, port.reason);
//! }
//! # Ok(())
//! # }
//! ```

use medcab_core::{DeviceKind, Result};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backend::{PortInfo, PortKind, SerialBackend};

/// USB descriptor of a known USB-serial bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbSignature {
    pub name: &'static str,
    pub vendor_id: u16,
    pub product_id: u16,
}

/// Bridges matched at `high` confidence.
pub const KNOWN_BRIDGES: &[UsbSignature] = &[
    UsbSignature {
        name: "CH340",
        vendor_id: 0x1A86,
        product_id: 0x55D4,
    },
    UsbSignature {
        name: "Silicon Labs CP210x",
        vendor_id: 0x10C4,
        product_id: 0xEA60,
    },
    UsbSignature {
        name: "FTDI FT232",
        vendor_id: 0x0403,
        product_id: 0x6001,
    },
];

/// Lowercase substrings of manufacturer/product strings matched at `medium`.
const VENDOR_HINTS: &[&str] = &[
    "ch340",
    "ch341",
    "wch",
    "qinheng",
    "silicon labs",
    "cp210",
    "ftdi",
    "prolific",
];

/// Lowercase path fragments of USB serial device nodes matched at `low`.
const GENERIC_PATH_HINTS: &[&str] = &["ttyusb", "ttyacm", "usbserial", "usbmodem"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Unknown,
    Low,
    Medium,
    High,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
            Confidence::Unknown => "unknown",
        };
        f.pad(s)
    }
}

/// A port annotated with how likely it is to be a cabinet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedPort {
    pub path: String,
    pub manufacturer: Option<String>,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub confidence: Confidence,
    pub reason: String,
}

impl DetectedPort {
    /// Score a single enumerated port.
    pub fn score(port: &PortInfo) -> Self {
        let (confidence, reason) = classify(port);
        Self {
            path: port.path.clone(),
            manufacturer: port.manufacturer.clone(),
            vendor_id: port.vendor_id,
            product_id: port.product_id,
            confidence,
            reason,
        }
    }

    /// `VID:PID` in uppercase hex, when the port has a USB descriptor.
    pub fn usb_id(&self) -> Option<String> {
        match (self.vendor_id, self.product_id) {
            (Some(vid), Some(pid)) => Some(format!("{vid:04X}:{pid:04X}")),
            _ => None,
        }
    }
}

fn classify(port: &PortInfo) -> (Confidence, String) {
    if let (Some(vid), Some(pid)) = (port.vendor_id, port.product_id)
        && let Some(bridge) = KNOWN_BRIDGES
            .iter()
            .find(|b| b.vendor_id == vid && b.product_id == pid)
    {
        return (
            Confidence::High,
            format!("{} bridge ({vid:04X}:{pid:04X})", bridge.name),
        );
    }

    let descriptors = [port.manufacturer.as_deref(), port.product.as_deref()];
    for text in descriptors.into_iter().flatten() {
        let lower = text.to_lowercase();
        if let Some(hint) = VENDOR_HINTS.iter().find(|h| lower.contains(*h)) {
            return (
                Confidence::Medium,
                format!("descriptor '{text}' matches '{hint}'"),
            );
        }
    }

    if port.kind == PortKind::Usb {
        return (Confidence::Low, "unrecognised USB serial device".to_string());
    }

    let path = port.path.to_lowercase();
    if let Some(hint) = GENERIC_PATH_HINTS.iter().find(|h| path.contains(*h)) {
        return (Confidence::Low, format!("path looks like a {hint} device"));
    }
    if is_com_port(&port.path) {
        return (Confidence::Low, "Windows COM port".to_string());
    }

    (Confidence::Unknown, "no serial bridge signature".to_string())
}

fn is_com_port(path: &str) -> bool {
    let upper = path.to_ascii_uppercase();
    upper
        .strip_prefix("COM")
        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
}

/// Scans a [`SerialBackend`] for cabinet controllers.
#[derive(Debug, Clone)]
pub struct PortDetector<B> {
    backend: B,
    kind: DeviceKind,
}

impl<B: SerialBackend> PortDetector<B> {
    pub fn new(backend: B, kind: DeviceKind) -> Self {
        Self { backend, kind }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Every port the OS reports, scored, in enumeration order.
    pub fn list_all(&self) -> Result<Vec<DetectedPort>> {
        let ports = self.backend.available_ports()?;
        Ok(ports.iter().map(DetectedPort::score).collect())
    }

    /// Ports with at least `low` confidence, in enumeration order.
    pub fn detect_candidates(&self) -> Result<Vec<DetectedPort>> {
        let candidates: Vec<_> = self
            .list_all()?
            .into_iter()
            .filter(|p| p.confidence > Confidence::Unknown)
            .collect();
        debug!(count = candidates.len(), "Cabinet port candidates");
        Ok(candidates)
    }

    /// The highest-confidence candidate. Earlier ports win ties.
    pub fn get_best_port(&self) -> Result<Option<DetectedPort>> {
        let mut best: Option<DetectedPort> = None;
        for candidate in self.detect_candidates()? {
            if best
                .as_ref()
                .is_none_or(|b| candidate.confidence > b.confidence)
            {
                best = Some(candidate);
            }
        }

        match &best {
            Some(port) => info!(
                path = %port.path,
                confidence = %port.confidence,
                reason = %port.reason,
                "Selected cabinet port"
            ),
            None => warn!("No cabinet port candidates found"),
        }
        Ok(best)
    }

    /// Pre-flight check: can `path` be opened at this device's baud rate?
    pub fn test_connection(&self, path: &str, timeout: Duration) -> bool {
        match self.backend.probe(path, self.kind.baud_rate(), timeout) {
            Ok(()) => {
                debug!(path, "Port opened");
                true
            }
            Err(e) => {
                debug!(path, error = %e, "Port unavailable");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(PortInfo::usb("/dev/ttyUSB0", 0x1A86, 0x55D4), Confidence::High)]
    #[case(PortInfo::usb("COM4", 0x10C4, 0xEA60), Confidence::High)]
    #[case(PortInfo::usb("/dev/ttyUSB1", 0x0403, 0x6001), Confidence::High)]
    #[case(
        PortInfo::usb("/dev/ttyUSB2", 0x1A86, 0x7523).manufacturer("QinHeng Electronics"),
        Confidence::Medium
    )]
    #[case(
        PortInfo::usb("/dev/ttyUSB3", 0x067B, 0x2303).product("Prolific USB-Serial Controller"),
        Confidence::Medium
    )]
    #[case(PortInfo::usb("/dev/ttyACM0", 0x2E8A, 0x000A), Confidence::Low)]
    #[case(PortInfo::new("/dev/cu.usbserial-1410", PortKind::Unknown), Confidence::Low)]
    #[case(PortInfo::new("COM3", PortKind::Unknown), Confidence::Low)]
    #[case(PortInfo::new("/dev/ttyS0", PortKind::Pci), Confidence::Unknown)]
    #[case(PortInfo::new("/dev/rfcomm0", PortKind::Bluetooth), Confidence::Unknown)]
    fn test_confidence_rules(#[case] port: PortInfo, #[case] expected: Confidence) {
        assert_eq!(DetectedPort::score(&port).confidence, expected);
    }

    #[test]
    fn test_vid_pid_beats_manufacturer_string() {
        let port = PortInfo::usb("/dev/ttyUSB0", 0x1A86, 0x55D4).manufacturer("FTDI");
        let detected = DetectedPort::score(&port);
        assert_eq!(detected.confidence, Confidence::High);
        assert!(detected.reason.contains("CH340"));
        assert_eq!(detected.usb_id().as_deref(), Some("1A86:55D4"));
    }

    #[test]
    fn test_confidence_ordering() {
        assert!(Confidence::High > Confidence::Medium);
        assert!(Confidence::Medium > Confidence::Low);
        assert!(Confidence::Low > Confidence::Unknown);
    }

    #[rstest]
    #[case("COM1", true)]
    #[case("com12", true)]
    #[case("COM", false)]
    #[case("/dev/com1", false)]
    #[case("COMX", false)]
    fn test_com_port_names(#[case] path: &str, #[case] expected: bool) {
        assert_eq!(is_com_port(path), expected);
    }

    #[test]
    fn test_confidence_serialization() {
        let json = serde_json::to_string(&Confidence::Medium).unwrap();
        assert_eq!(json, "\"medium\"");
    }
}
