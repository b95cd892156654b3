//! Sensor drivers and the capability/sampling model they share.

pub mod aht20;
pub mod bme280;
pub mod dps310;
pub mod mcp9808;
pub mod scd30;
pub mod scd4x;

pub use aht20::Aht20;
pub use bme280::Bme280;
pub use dps310::Dps310;
pub use mcp9808::Mcp9808;
pub use scd30::Scd30;
pub use scd4x::Scd4x;

use crate::bus::{BusHandle, TransferError};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Standard sea-level pressure used for altitude estimates, in hPa.
pub const SEA_LEVEL_PRESSURE_HPA: f32 = 1013.25;

/// A single measurable quantity. Declaration order is the scheduler's fixed
/// evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Capability {
    AmbientTemperature,
    RelativeHumidity,
    Pressure,
    CO2,
    Altitude,
}

impl Capability {
    pub const COUNT: usize = 5;

    pub const ALL: [Capability; Capability::COUNT] = [
        Capability::AmbientTemperature,
        Capability::RelativeHumidity,
        Capability::Pressure,
        Capability::CO2,
        Capability::Altitude,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// SI unit the driver boundary normalizes readings to.
    pub fn unit(self) -> &'static str {
        match self {
            Capability::AmbientTemperature => "°C",
            Capability::RelativeHumidity => "%RH",
            Capability::Pressure => "hPa",
            Capability::CO2 => "ppm",
            Capability::Altitude => "m",
        }
    }
}

impl core::fmt::Display for Capability {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Capability::AmbientTemperature => "ambient temperature",
            Capability::RelativeHumidity => "relative humidity",
            Capability::Pressure => "pressure",
            Capability::CO2 => "CO2",
            Capability::Altitude => "altitude",
        };
        f.write_str(name)
    }
}

pub type CapabilitySet = Vec<Capability, { Capability::COUNT }>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SamplingState {
    /// Sampling period; `None` or zero means disabled.
    pub period_ms: Option<u64>,
    pub last_sample_time: u64,
}

impl SamplingState {
    pub fn is_due(&self, now: u64) -> bool {
        match self.period_ms {
            Some(period) if period > 0 => now.saturating_sub(self.last_sample_time) > period,
            _ => false,
        }
    }
}

/// Sampling state for the capabilities a driver advertises. Slots for
/// capabilities the chip cannot measure stay `None`.
#[derive(Debug, Clone, Default)]
pub struct SamplingTable {
    slots: [Option<SamplingState>; Capability::COUNT],
}

impl SamplingTable {
    pub fn new(capabilities: &[Capability]) -> Self {
        let mut table = Self::default();
        for capability in capabilities {
            table.slots[capability.index()] = Some(SamplingState::default());
        }
        table
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.slots[capability.index()].is_some()
    }

    pub fn capabilities(&self) -> CapabilitySet {
        Capability::ALL
            .iter()
            .copied()
            .filter(|capability| self.supports(*capability))
            .collect()
    }

    pub fn get(&self, capability: Capability) -> Option<&SamplingState> {
        self.slots[capability.index()].as_ref()
    }

    pub fn get_mut(&mut self, capability: Capability) -> Option<&mut SamplingState> {
        self.slots[capability.index()].as_mut()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("bus transfer failed: {0}")]
    Transfer(#[from] TransferError),
    #[error("unexpected chip id 0x{found:02X} (expected 0x{expected:02X})")]
    WrongChip { expected: u8, found: u8 },
    #[error("checksum mismatch")]
    Checksum,
    #[error("chip not ready")]
    NotReady,
    #[error("capability {0} not supported by this chip")]
    Unsupported(Capability),
    #[error("conversion produced an invalid value")]
    Conversion,
}

/// One physical device on the bus.
///
/// Drivers never hold the bus; every transaction borrows it for the duration
/// of the call so the manager stays the single owner.
pub trait Driver {
    fn chip(&self) -> &'static str;

    fn address(&self) -> u8;

    fn sampling(&self) -> &SamplingTable;

    fn sampling_mut(&mut self) -> &mut SamplingTable;

    /// Read one capability, converted to its SI unit.
    fn sample(&mut self, bus: &mut dyn BusHandle, capability: Capability) -> Result<f32, DriverError>;

    /// Put the chip back into an idle state before the driver is dropped.
    fn release(&mut self, _bus: &mut dyn BusHandle) -> Result<(), DriverError> {
        Ok(())
    }

    fn capabilities(&self) -> CapabilitySet {
        self.sampling().capabilities()
    }

    fn supports(&self, capability: Capability) -> bool {
        self.sampling().supports(capability)
    }

    fn period(&self, capability: Capability) -> Option<u64> {
        self.sampling().get(capability).and_then(|state| state.period_ms)
    }

    /// Returns false when the chip does not advertise `capability`.
    fn set_period(&mut self, capability: Capability, period_ms: u64) -> bool {
        match self.sampling_mut().get_mut(capability) {
            Some(state) => {
                state.period_ms = if period_ms == 0 { None } else { Some(period_ms) };
                true
            }
            None => false,
        }
    }

    fn last_sample_time(&self, capability: Capability) -> Option<u64> {
        self.sampling().get(capability).map(|state| state.last_sample_time)
    }

    fn set_last_sample_time(&mut self, capability: Capability, time: u64) {
        if let Some(state) = self.sampling_mut().get_mut(capability) {
            state.last_sample_time = time;
        }
    }

    fn is_due(&self, capability: Capability, now: u64) -> bool {
        self.sampling()
            .get(capability)
            .is_some_and(|state| state.is_due(now))
    }
}

/// CRC-8 used by Sensirion and Aosong sensors (polynomial 0x31, init 0xFF).
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0xFF;
    for byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 { (crc << 1) ^ 0x31 } else { crc << 1 };
        }
    }
    crc
}

/// Altitude in meters from pressure in hPa, international barometric formula.
pub fn pressure_to_altitude(pressure_hpa: f32) -> f32 {
    44_330.0 * (1.0 - (pressure_hpa / SEA_LEVEL_PRESSURE_HPA).powf(0.1903))
}

/// Sign-extend the low `bits` bits of `value`.
pub(crate) fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

/// Read one 16-bit word plus CRC per entry from a Sensirion-style frame.
pub(crate) fn sensirion_words<const N: usize>(frame: &[u8]) -> Result<[u16; N], DriverError> {
    let mut words = [0u16; N];
    for (word, chunk) in words.iter_mut().zip(frame.chunks_exact(3)) {
        if crc8(&chunk[..2]) != chunk[2] {
            return Err(DriverError::Checksum);
        }
        *word = u16::from_be_bytes([chunk[0], chunk[1]]);
    }
    Ok(words)
}

/// Last measurement frame from a chip that reports several quantities at
/// once. Each quantity is handed out at most once per frame.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Frame<M> {
    measurement: Option<M>,
    unserved: u8,
}

impl<M: Copy> Frame<M> {
    pub(crate) const fn empty() -> Self {
        Self {
            measurement: None,
            unserved: 0,
        }
    }

    pub(crate) fn load(&mut self, measurement: M, capabilities: &[Capability]) {
        self.measurement = Some(measurement);
        self.unserved = capabilities
            .iter()
            .fold(0, |mask, capability| mask | (1 << capability.index()));
    }

    pub(crate) fn take(&mut self, capability: Capability) -> Option<M> {
        let bit = 1 << capability.index();
        if self.unserved & bit == 0 {
            return None;
        }
        self.unserved &= !bit;
        self.measurement
    }
}

/// Encode a Sensirion command with an optional 16-bit argument and its CRC.
pub(crate) fn sensirion_command(command: u16, argument: Option<u16>) -> Vec<u8, 5> {
    let mut frame = Vec::new();
    let _ = frame.extend_from_slice(&command.to_be_bytes());
    if let Some(argument) = argument {
        let bytes = argument.to_be_bytes();
        let _ = frame.extend_from_slice(&bytes);
        let _ = frame.push(crc8(&bytes));
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc8_datasheet_vector() {
        // Sensirion datasheet example: 0xBEEF -> 0x92
        assert_eq!(crc8(&[0xBE, 0xEF]), 0x92);
    }

    #[test]
    fn test_sampling_state_due_boundaries() {
        let state = SamplingState {
            period_ms: Some(5000),
            last_sample_time: 1000,
        };
        assert!(!state.is_due(5999));
        assert!(!state.is_due(6000));
        assert!(state.is_due(6001));

        let disabled = SamplingState {
            period_ms: Some(0),
            last_sample_time: 0,
        };
        assert!(!disabled.is_due(u64::MAX));
        assert!(!SamplingState::default().is_due(u64::MAX));
    }

    #[test]
    fn test_sampling_table_tracks_advertised_capabilities() {
        let table = SamplingTable::new(&[Capability::Pressure, Capability::AmbientTemperature]);
        assert!(table.supports(Capability::Pressure));
        assert!(!table.supports(Capability::CO2));
        let capabilities = table.capabilities();
        assert_eq!(
            capabilities.as_slice(),
            &[Capability::AmbientTemperature, Capability::Pressure]
        );
    }

    #[test]
    fn test_sign_extend() {
        assert_eq!(sign_extend(0xFFF, 12), -1);
        assert_eq!(sign_extend(0x7FF, 12), 2047);
        assert_eq!(sign_extend(0x80000, 20), -524_288);
    }

    #[test]
    fn test_sensirion_words_rejects_bad_crc() {
        let good = [0xBE, 0xEF, 0x92];
        assert_eq!(sensirion_words::<1>(&good).unwrap(), [0xBEEF]);
        let bad = [0xBE, 0xEF, 0x00];
        assert_eq!(sensirion_words::<1>(&bad), Err(DriverError::Checksum));
    }

    #[test]
    fn test_frame_serves_each_capability_once() {
        let mut frame = Frame::empty();
        assert_eq!(frame.take(Capability::CO2), None);

        frame.load(7u16, &[Capability::CO2, Capability::AmbientTemperature]);
        assert_eq!(frame.take(Capability::CO2), Some(7));
        assert_eq!(frame.take(Capability::CO2), None);
        assert_eq!(frame.take(Capability::Pressure), None);
        assert_eq!(frame.take(Capability::AmbientTemperature), Some(7));

        frame.load(8, &[Capability::CO2]);
        assert_eq!(frame.take(Capability::CO2), Some(8));
    }

    #[test]
    fn test_altitude_at_sea_level_is_zero() {
        assert!(pressure_to_altitude(SEA_LEVEL_PRESSURE_HPA).abs() < 0.01);
        assert!(pressure_to_altitude(900.0) > 900.0);
    }
}
