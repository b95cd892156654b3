use super::{sensirion_command, sensirion_words, Capability, Driver, DriverError, Frame, SamplingTable};
use crate::bus::BusHandle;
use tracing::debug;

pub const DEFAULT_ADDRESS: u8 = 0x61;

pub const CMD_START_CONTINUOUS: u16 = 0x0010;
pub const CMD_STOP_CONTINUOUS: u16 = 0x0104;
pub const CMD_MEASUREMENT_INTERVAL: u16 = 0x4600;
pub const CMD_DATA_READY: u16 = 0x0202;
pub const CMD_READ_MEASUREMENT: u16 = 0x0300;
pub const CMD_FIRMWARE_VERSION: u16 = 0xD100;

const MEASUREMENT_INTERVAL_S: u16 = 2;

const CAPABILITIES: [Capability; 3] = [
    Capability::AmbientTemperature,
    Capability::RelativeHumidity,
    Capability::CO2,
];
const COMMAND_DELAY_MS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub co2_ppm: f32,
    pub temperature_c: f32,
    pub humidity_percent: f32,
}

impl Measurement {
    fn value(&self, capability: Capability) -> f32 {
        match capability {
            Capability::CO2 => self.co2_ppm,
            Capability::RelativeHumidity => self.humidity_percent,
            _ => self.temperature_c,
        }
    }
}

/// Sensirion SCD30 NDIR CO2 sensor.
///
/// A single measurement carries all three quantities. Reading it clears the
/// chip's data-ready flag, so the frame is kept until each quantity in it
/// has been reported once.
#[derive(Debug)]
pub struct Scd30 {
    address: u8,
    firmware_version: u16,
    frame: Frame<Measurement>,
    sampling: SamplingTable,
}

impl Scd30 {
    pub fn probe(bus: &mut dyn BusHandle, address: u8) -> Result<Self, DriverError> {
        let [firmware_version] = read_words::<1>(bus, address, CMD_FIRMWARE_VERSION)?;
        send(bus, address, CMD_MEASUREMENT_INTERVAL, Some(MEASUREMENT_INTERVAL_S))?;
        // Argument 0 disables ambient pressure compensation
        send(bus, address, CMD_START_CONTINUOUS, Some(0))?;

        Ok(Self {
            address,
            firmware_version,
            frame: Frame::empty(),
            sampling: SamplingTable::new(&CAPABILITIES),
        })
    }

    pub fn firmware_version(&self) -> u16 {
        self.firmware_version
    }

    /// Read a new measurement if the chip has one. `None` when not ready.
    fn read_measurement(&mut self, bus: &mut dyn BusHandle) -> Result<Option<Measurement>, DriverError> {
        let [ready] = read_words::<1>(bus, self.address, CMD_DATA_READY)?;
        if ready != 1 {
            return Ok(None);
        }
        let words = read_words::<6>(bus, self.address, CMD_READ_MEASUREMENT)?;
        let float = |high: u16, low: u16| f32::from_bits((u32::from(high) << 16) | u32::from(low));
        let measurement = Measurement {
            co2_ppm: float(words[0], words[1]),
            temperature_c: float(words[2], words[3]),
            humidity_percent: float(words[4], words[5]),
        };
        if !measurement.co2_ppm.is_finite() || !measurement.temperature_c.is_finite() {
            return Err(DriverError::Conversion);
        }
        debug!(address = self.address, ?measurement, "scd30 measurement");
        Ok(Some(measurement))
    }
}

fn send(bus: &mut dyn BusHandle, address: u8, command: u16, argument: Option<u16>) -> Result<(), DriverError> {
    bus.write(address, &sensirion_command(command, argument))?;
    Ok(())
}

fn read_words<const N: usize>(
    bus: &mut dyn BusHandle,
    address: u8,
    command: u16,
) -> Result<[u16; N], DriverError> {
    send(bus, address, command, None)?;
    bus.delay_ms(COMMAND_DELAY_MS);
    let mut frame = [0u8; 18];
    let frame = &mut frame[..N * 3];
    bus.read(address, frame)?;
    sensirion_words::<N>(frame)
}

impl Driver for Scd30 {
    fn chip(&self) -> &'static str {
        "scd30"
    }

    fn address(&self) -> u8 {
        self.address
    }

    fn sampling(&self) -> &SamplingTable {
        &self.sampling
    }

    fn sampling_mut(&mut self) -> &mut SamplingTable {
        &mut self.sampling
    }

    fn sample(&mut self, bus: &mut dyn BusHandle, capability: Capability) -> Result<f32, DriverError> {
        if !self.supports(capability) {
            return Err(DriverError::Unsupported(capability));
        }
        if let Some(measurement) = self.read_measurement(bus)? {
            self.frame.load(measurement, &CAPABILITIES);
        }
        self.frame
            .take(capability)
            .map(|measurement| measurement.value(capability))
            .ok_or(DriverError::NotReady)
    }

    fn release(&mut self, bus: &mut dyn BusHandle) -> Result<(), DriverError> {
        send(bus, self.address, CMD_STOP_CONTINUOUS, None)
    }
}
