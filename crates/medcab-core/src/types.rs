use crate::{
    Result,
    constants::{
        ASK_DATA_VERIFICATION_FAILED, ASK_FAILED, ASK_SUCCESS, ASK_TIMEOUT, ASK_UNKNOWN_COMMAND,
        DEFAULT_ADDRESS, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_MS, DEFAULT_TIMEOUT_MS,
        DS12_BAUD_RATE, DS12_SLOT_COUNT, DS16_BAUD_RATE, DS16_SLOT_COUNT, DS16_USABLE_SLOTS,
    },
    error::Error,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use subtle::ConstantTimeEq;

/// Cabinet controller hardware variant.
///
/// The variant fixes the line speed and the width of the status bitmask.
/// Production binaries select it at build time through the `ds12` / `ds16`
/// cargo features (see [`DeviceKind::compiled`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceKind {
    /// 12-slot controller at 19200 baud.
    Ds12,
    /// 16-slot controller at 38400 baud (15 slots exposed).
    Ds16,
}

impl DeviceKind {
    /// The variant selected by cargo features.
    ///
    /// `ds16` wins when both features are enabled, since `ds12` is on by default.
    #[must_use]
    pub const fn compiled() -> Self {
        if cfg!(feature = "ds16") {
            DeviceKind::Ds16
        } else {
            DeviceKind::Ds12
        }
    }

    #[must_use]
    pub const fn baud_rate(self) -> u32 {
        match self {
            DeviceKind::Ds12 => DS12_BAUD_RATE,
            DeviceKind::Ds16 => DS16_BAUD_RATE,
        }
    }

    /// Number of bits carried by a status response.
    #[must_use]
    pub const fn slot_count(self) -> u8 {
        match self {
            DeviceKind::Ds12 => DS12_SLOT_COUNT,
            DeviceKind::Ds16 => DS16_SLOT_COUNT,
        }
    }

    /// Highest slot number an operator may address.
    #[must_use]
    pub const fn usable_slots(self) -> u8 {
        match self {
            DeviceKind::Ds12 => DS12_SLOT_COUNT,
            DeviceKind::Ds16 => DS16_USABLE_SLOTS,
        }
    }

    /// Data bytes needed to hold one bit per slot.
    #[must_use]
    pub const fn status_bytes(self) -> usize {
        (self.slot_count() as usize).div_ceil(8)
    }
}

impl Default for DeviceKind {
    fn default() -> Self {
        Self::compiled()
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DeviceKind::Ds12 => write!(f, "DS12"),
            DeviceKind::Ds16 => write!(f, "DS16"),
        }
    }
}

impl std::str::FromStr for DeviceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DS12" => Ok(DeviceKind::Ds12),
            "DS16" => Ok(DeviceKind::Ds16),
            other => Err(Error::Config(format!(
                "Unknown device kind '{other}', expected DS12 or DS16"
            ))),
        }
    }
}

/// Physical slot number (1-based), validated against a device variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(u8);

impl SlotId {
    /// Create a slot id for the given device.
    ///
    /// # Errors
    /// Returns `Error::SlotOutOfRange` if the slot is outside `1..=kind.usable_slots()`.
    pub fn new(slot: u8, kind: DeviceKind) -> Result<Self> {
        let max = kind.usable_slots();
        if !(1..=max).contains(&slot) {
            return Err(Error::SlotOutOfRange { slot, max });
        }
        Ok(SlotId(slot))
    }

    #[must_use]
    pub fn as_u8(&self) -> u8 {
        self.0
    }

    /// Index used on the wire by the unlock command.
    #[must_use]
    pub fn zero_based(&self) -> u8 {
        self.0 - 1
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Drawer position as reported by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Open,
    Closed,
}

/// Decoded state of a single slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotState {
    pub slot_number: u8,
    pub is_open: bool,
    pub status: SlotStatus,
}

impl SlotState {
    #[must_use]
    pub fn new(slot_number: u8, is_open: bool) -> Self {
        Self {
            slot_number,
            is_open,
            status: if is_open {
                SlotStatus::Open
            } else {
                SlotStatus::Closed
            },
        }
    }
}

/// Response code carried in the ASK byte of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum AskCode {
    Success = ASK_SUCCESS,
    Failed = ASK_FAILED,
    Timeout = ASK_TIMEOUT,
    UnknownCommand = ASK_UNKNOWN_COMMAND,
    DataVerificationFailed = ASK_DATA_VERIFICATION_FAILED,
}

impl AskCode {
    /// # Errors
    /// Returns `Error::InvalidResponse` for bytes outside `0x10..=0x14`.
    #[inline]
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            ASK_SUCCESS => Ok(AskCode::Success),
            ASK_FAILED => Ok(AskCode::Failed),
            ASK_TIMEOUT => Ok(AskCode::Timeout),
            ASK_UNKNOWN_COMMAND => Ok(AskCode::UnknownCommand),
            ASK_DATA_VERIFICATION_FAILED => Ok(AskCode::DataVerificationFailed),
            _ => Err(Error::invalid_response(format!(
                "unknown ASK code 0x{value:02X}"
            ))),
        }
    }

    #[inline]
    #[must_use]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    #[inline]
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, AskCode::Success)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            AskCode::Success => "ASK_SUCCESS",
            AskCode::Failed => "ASK_FAILED",
            AskCode::Timeout => "ASK_TIMEOUT",
            AskCode::UnknownCommand => "ASK_UNKNOWN_COMMAND",
            AskCode::DataVerificationFailed => "ASK_DATA_VERIFICATION_FAILED",
        }
    }
}

impl fmt::Display for AskCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), self.to_u8())
    }
}

/// Serial link configuration for one controller.
///
/// # Example
///
/// ```
/// use medcab_core::{ConnectionConfig, DeviceKind};
///
/// let config = ConnectionConfig::for_device(DeviceKind::Ds12, "/dev/ttyUSB0")
///     .timeout_ms(1500)
///     .max_retries(5);
///
/// assert_eq!(config.baud_rate, 19_200);
/// assert_eq!(config.timeout().as_millis(), 1500);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// OS path of the serial port (e.g. `/dev/ttyUSB0`, `COM3`)
    pub port_path: String,

    /// Line speed, fixed by the device variant
    pub baud_rate: u32,

    /// Time to wait for one complete response frame
    pub timeout_ms: u64,

    /// Attempts per command before reporting a timeout
    pub max_retries: u32,

    /// Fixed pause between attempts
    pub retry_delay_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::for_device(DeviceKind::compiled(), "")
    }
}

impl ConnectionConfig {
    /// Create a configuration with the variant's baud rate and default timings.
    pub fn for_device(kind: DeviceKind, port_path: impl Into<String>) -> Self {
        Self {
            port_path: port_path.into(),
            baud_rate: kind.baud_rate(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }

    /// Set the port path
    pub fn port_path(mut self, path: impl Into<String>) -> Self {
        self.port_path = path.into();
        self
    }

    /// Set the response timeout
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set the number of attempts per command
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the pause between attempts
    pub fn retry_delay_ms(mut self, retry_delay_ms: u64) -> Self {
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Number of attempts actually made; zero is treated as one.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

/// Everything needed to construct a controller for one cabinet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub kind: DeviceKind,

    /// Bus address written in the ADDR byte
    pub address: u8,

    pub connection: ConnectionConfig,
}

impl DeviceConfig {
    pub fn new(kind: DeviceKind, port_path: impl Into<String>) -> Self {
        Self {
            kind,
            address: DEFAULT_ADDRESS,
            connection: ConnectionConfig::for_device(kind, port_path),
        }
    }

    /// Configuration for the variant compiled into this binary.
    pub fn compiled(port_path: impl Into<String>) -> Self {
        Self::new(DeviceKind::compiled(), port_path)
    }

    /// Set the bus address
    pub fn address(mut self, address: u8) -> Self {
        self.address = address;
        self
    }

    /// Replace the serial link configuration.
    ///
    /// The baud rate stays pinned to the device variant.
    pub fn connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = ConnectionConfig {
            baud_rate: self.kind.baud_rate(),
            ..connection
        };
        self
    }
}

/// Hospital number identifying the patient bound to a slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hn(String);

impl Hn {
    /// # Errors
    /// Returns `Error::Config` if the identifier is empty after trimming.
    pub fn new(hn: &str) -> Result<Self> {
        let hn = hn.trim();
        if hn.is_empty() {
            return Err(Error::Config("HN must not be empty".to_string()));
        }
        Ok(Hn(hn.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Hn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Hn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Hn::new(s)
    }
}

/// Operator passkey attached to a dispensing request.
///
/// # Security
/// Comparison runs in constant time and `Debug` never prints the value.
/// The core only carries the passkey for the audit trail; verification
/// happens in the caller before a request reaches the controller.
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct Passkey(String);

impl Passkey {
    pub fn new(passkey: impl Into<String>) -> Self {
        Passkey(passkey.into())
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl PartialEq for Passkey {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

impl Eq for Passkey {}

impl fmt::Debug for Passkey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Passkey(***)")
    }
}

/// In-flight record binding a slot and patient to an unlock/dispense request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispensingContext {
    pub slot_id: SlotId,
    pub hn: Hn,
    pub timestamp: DateTime<Utc>,
    pub passkey: Passkey,
}

impl DispensingContext {
    /// Create a context stamped with the current time.
    pub fn new(slot_id: SlotId, hn: Hn, passkey: Passkey) -> Self {
        Self {
            slot_id,
            hn,
            timestamp: Utc::now(),
            passkey,
        }
    }

    /// Override the request time (replays, tests).
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(DeviceKind::Ds12, 19_200, 12, 12, 2)]
    #[case(DeviceKind::Ds16, 38_400, 16, 15, 2)]
    fn test_device_kind_parameters(
        #[case] kind: DeviceKind,
        #[case] baud: u32,
        #[case] slots: u8,
        #[case] usable: u8,
        #[case] status_bytes: usize,
    ) {
        assert_eq!(kind.baud_rate(), baud);
        assert_eq!(kind.slot_count(), slots);
        assert_eq!(kind.usable_slots(), usable);
        assert_eq!(kind.status_bytes(), status_bytes);
    }

    #[rstest]
    #[case("ds12", DeviceKind::Ds12)]
    #[case("DS16", DeviceKind::Ds16)]
    #[case(" Ds12 ", DeviceKind::Ds12)]
    fn test_device_kind_parse(#[case] input: &str, #[case] expected: DeviceKind) {
        assert_eq!(input.parse::<DeviceKind>().unwrap(), expected);
    }

    #[test]
    fn test_device_kind_parse_invalid() {
        assert!("DS24".parse::<DeviceKind>().is_err());
    }

    #[test]
    fn test_compiled_kind_matches_features() {
        let expected = if cfg!(feature = "ds16") {
            DeviceKind::Ds16
        } else {
            DeviceKind::Ds12
        };
        assert_eq!(DeviceKind::compiled(), expected);
        assert_eq!(DeviceKind::default(), expected);
    }

    #[rstest]
    #[case(1, 0)]
    #[case(3, 2)]
    #[case(12, 11)]
    fn test_slot_id_valid(#[case] slot: u8, #[case] index: u8) {
        let id = SlotId::new(slot, DeviceKind::Ds12).unwrap();
        assert_eq!(id.as_u8(), slot);
        assert_eq!(id.zero_based(), index);
    }

    #[rstest]
    #[case(0, DeviceKind::Ds12)]
    #[case(13, DeviceKind::Ds12)]
    #[case(16, DeviceKind::Ds16)]
    fn test_slot_id_out_of_range(#[case] slot: u8, #[case] kind: DeviceKind) {
        let err = SlotId::new(slot, kind).unwrap_err();
        assert!(matches!(err, Error::SlotOutOfRange { slot: s, .. } if s == slot));
    }

    #[test]
    fn test_slot_state_status_follows_flag() {
        assert_eq!(SlotState::new(1, true).status, SlotStatus::Open);
        assert_eq!(SlotState::new(2, false).status, SlotStatus::Closed);
    }

    #[test]
    fn test_slot_state_serialization() {
        let json = serde_json::to_string(&SlotState::new(3, true)).unwrap();
        assert_eq!(json, r#"{"slotNumber":3,"isOpen":true,"status":"open"}"#);
    }

    #[rstest]
    #[case(0x10, AskCode::Success)]
    #[case(0x11, AskCode::Failed)]
    #[case(0x12, AskCode::Timeout)]
    #[case(0x13, AskCode::UnknownCommand)]
    #[case(0x14, AskCode::DataVerificationFailed)]
    fn test_ask_code_from_u8(#[case] byte: u8, #[case] expected: AskCode) {
        let code = AskCode::from_u8(byte).unwrap();
        assert_eq!(code, expected);
        assert_eq!(code.to_u8(), byte);
    }

    #[test]
    fn test_ask_code_unknown() {
        assert!(matches!(
            AskCode::from_u8(0x20),
            Err(Error::InvalidResponse { .. })
        ));
    }

    #[test]
    fn test_ask_code_display() {
        assert_eq!(AskCode::Failed.to_string(), "ASK_FAILED (0x11)");
    }

    #[test]
    fn test_connection_config_defaults() {
        let config = ConnectionConfig::for_device(DeviceKind::Ds16, "/dev/ttyUSB0");
        assert_eq!(config.baud_rate, 38_400);
        assert_eq!(config.timeout_ms, 3000);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay().as_millis(), 500);
    }

    #[test]
    fn test_connection_config_zero_retries_still_attempts_once() {
        let config = ConnectionConfig::default().max_retries(0);
        assert_eq!(config.attempts(), 1);
    }

    #[test]
    fn test_device_config_pins_baud_rate() {
        let custom = ConnectionConfig::for_device(DeviceKind::Ds12, "COM3").timeout_ms(100);
        let config = DeviceConfig::new(DeviceKind::Ds16, "").connection(custom);
        assert_eq!(config.connection.baud_rate, 38_400);
        assert_eq!(config.connection.port_path, "COM3");
        assert_eq!(config.connection.timeout_ms, 100);
    }

    #[rstest]
    #[case("HN001", "HN001")]
    #[case("  6601234  ", "6601234")]
    fn test_hn_valid(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(Hn::new(input).unwrap().as_str(), expected);
    }

    #[test]
    fn test_hn_empty() {
        assert!(Hn::new("   ").is_err());
    }

    #[test]
    fn test_passkey_redacted_debug() {
        let key = Passkey::new("1234");
        assert_eq!(format!("{key:?}"), "Passkey(***)");
        assert_eq!(key, Passkey::new("1234"));
        assert_ne!(key, Passkey::new("4321"));
    }

    #[test]
    fn test_dispensing_context_timestamp_override() {
        use chrono::TimeZone;

        let when = Utc.with_ymd_and_hms(2025, 3, 1, 8, 30, 0).unwrap();
        let ctx = DispensingContext::new(
            SlotId::new(4, DeviceKind::Ds12).unwrap(),
            Hn::new("HN4").unwrap(),
            Passkey::new("pk"),
        )
        .with_timestamp(when);
        assert_eq!(ctx.timestamp, when);
        assert_eq!(ctx.slot_id.as_u8(), 4);
    }
}
