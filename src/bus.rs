//! Two-wire bus transport abstraction and bus-level state.
//!
//! The transport itself is an external collaborator: firmware targets plug in
//! their HAL through [`BusHandle`], tests and the host bridge use
//! [`crate::sim::SimulatedBus`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_FREQUENCY_HZ: u32 = 100_000;

/// Lowest address probed by a scan; 0x00..=0x07 are reserved.
pub const SCAN_FIRST_ADDRESS: u8 = 0x08;
/// Highest address probed by a scan; 0x78..=0x7F are reserved but 0x7E is
/// still probed for parity with common bus scanners.
pub const SCAN_LAST_ADDRESS: u8 = 0x7E;
pub const MAX_SEVEN_BIT_ADDRESS: u8 = 0x7F;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    pub port: u8,
    pub sda_pin: u8,
    pub scl_pin: u8,
    #[serde(default = "default_frequency")]
    pub frequency_hz: u32,
}

fn default_frequency() -> u32 {
    DEFAULT_FREQUENCY_HZ
}

impl BusConfig {
    pub fn new(port: u8, sda_pin: u8, scl_pin: u8) -> Self {
        Self {
            port,
            sda_pin,
            scl_pin,
            frequency_hz: DEFAULT_FREQUENCY_HZ,
        }
    }

    #[must_use]
    pub fn with_frequency(mut self, frequency_hz: u32) -> Self {
        self.frequency_hz = frequency_hz;
        self
    }
}

/// Status reported with every control-plane response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusStatus {
    Success,
    ErrorPullups,
    ErrorHang,
    ErrorShorted,
    DeviceInitFail,
    UnsupportedDevice,
    DeviceAlreadyInitialized,
    Unspecified,
}

impl BusStatus {
    pub fn is_bus_fault(self) -> bool {
        matches!(
            self,
            BusStatus::ErrorPullups | BusStatus::ErrorHang | BusStatus::ErrorShorted
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusState {
    pub initialized: bool,
    pub status: BusStatus,
}

impl Default for BusState {
    fn default() -> Self {
        Self {
            initialized: false,
            status: BusStatus::Unspecified,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineMode {
    /// Input with the internal pull-up enabled.
    PullUp,
    /// High-impedance input.
    Floating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

/// Per-transfer failure codes, mirroring what two-wire HALs report from an
/// end-of-transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("payload too long for transmit buffer")]
    DataTooLong,
    #[error("address not acknowledged")]
    AddressNack,
    #[error("data not acknowledged")]
    DataNack,
    #[error("bus busy or timed out")]
    Timeout,
    #[error("data and clock lines shorted")]
    Shorted,
    #[error("transport failure code {0}")]
    Other(u8),
}

impl TransferError {
    /// Numeric code as reported by end-of-transmission on common HALs.
    pub fn code(self) -> u8 {
        match self {
            TransferError::DataTooLong => 1,
            TransferError::AddressNack => 2,
            TransferError::DataNack => 3,
            TransferError::Timeout => 5,
            TransferError::Shorted => 7,
            TransferError::Other(code) => code,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => None,
            1 => Some(TransferError::DataTooLong),
            2 => Some(TransferError::AddressNack),
            3 => Some(TransferError::DataNack),
            5 => Some(TransferError::Timeout),
            7 => Some(TransferError::Shorted),
            other => Some(TransferError::Other(other)),
        }
    }
}

/// Raw two-wire transport. Not reentrant: callers keep one transaction in
/// flight at a time.
pub trait BusHandle {
    fn configure_line(&mut self, pin: u8, mode: LineMode);

    fn read_line(&mut self, pin: u8) -> Level;

    /// Open the transport on the configured pins at the configured frequency.
    fn open(&mut self, config: &BusConfig) -> Result<(), TransferError>;

    /// Zero-length write used for address discovery.
    fn probe(&mut self, address: u8) -> Result<(), TransferError>;

    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), TransferError>;

    fn read(&mut self, address: u8, buffer: &mut [u8]) -> Result<(), TransferError>;

    fn write_read(
        &mut self,
        address: u8,
        bytes: &[u8],
        buffer: &mut [u8],
    ) -> Result<(), TransferError> {
        self.write(address, bytes)?;
        self.read(address, buffer)
    }

    /// Bounded blocking delay.
    fn delay_ms(&mut self, ms: u32);
}

impl<T: BusHandle + ?Sized> BusHandle for &mut T {
    fn configure_line(&mut self, pin: u8, mode: LineMode) {
        (**self).configure_line(pin, mode);
    }

    fn read_line(&mut self, pin: u8) -> Level {
        (**self).read_line(pin)
    }

    fn open(&mut self, config: &BusConfig) -> Result<(), TransferError> {
        (**self).open(config)
    }

    fn probe(&mut self, address: u8) -> Result<(), TransferError> {
        (**self).probe(address)
    }

    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), TransferError> {
        (**self).write(address, bytes)
    }

    fn read(&mut self, address: u8, buffer: &mut [u8]) -> Result<(), TransferError> {
        (**self).read(address, buffer)
    }

    fn write_read(
        &mut self,
        address: u8,
        bytes: &[u8],
        buffer: &mut [u8],
    ) -> Result<(), TransferError> {
        (**self).write_read(address, bytes, buffer)
    }

    fn delay_ms(&mut self, ms: u32) {
        (**self).delay_ms(ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_error_codes_round_trip() {
        for code in 1..=8u8 {
            let error = TransferError::from_code(code).unwrap();
            assert_eq!(error.code(), code);
        }
        assert!(TransferError::from_code(0).is_none());
    }

    #[test]
    fn test_bus_config_frequency_defaults() {
        let config: BusConfig = serde_json::from_str(r#"{"port":0,"sda_pin":4,"scl_pin":5}"#).unwrap();
        assert_eq!(config.frequency_hz, DEFAULT_FREQUENCY_HZ);
        assert_eq!(config.with_frequency(400_000).frequency_hz, 400_000);
    }

    #[test]
    fn test_bus_fault_classification() {
        assert!(BusStatus::ErrorHang.is_bus_fault());
        assert!(BusStatus::ErrorShorted.is_bus_fault());
        assert!(!BusStatus::DeviceInitFail.is_bus_fault());
    }
}
