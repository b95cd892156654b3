use super::{sensirion_command, sensirion_words, Capability, Driver, DriverError, Frame, SamplingTable};
use crate::bus::BusHandle;
use tracing::debug;

pub const DEFAULT_ADDRESS: u8 = 0x62;

pub const CMD_START_PERIODIC: u16 = 0x21B1;
pub const CMD_STOP_PERIODIC: u16 = 0x3F86;
pub const CMD_READ_MEASUREMENT: u16 = 0xEC05;
pub const CMD_DATA_READY: u16 = 0xE4B8;
pub const CMD_SERIAL_NUMBER: u16 = 0x3682;

const STOP_DELAY_MS: u32 = 500;
const COMMAND_DELAY_MS: u32 = 1;
const DATA_READY_MASK: u16 = 0x07FF;

const CAPABILITIES: [Capability; 3] = [
    Capability::AmbientTemperature,
    Capability::RelativeHumidity,
    Capability::CO2,
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub co2_ppm: u16,
    pub temperature_c: f32,
    pub humidity_percent: f32,
}

impl Measurement {
    pub fn from_words(words: [u16; 3]) -> Self {
        Self {
            co2_ppm: words[0],
            temperature_c: -45.0 + 175.0 * f32::from(words[1]) / 65_535.0,
            humidity_percent: 100.0 * f32::from(words[2]) / 65_535.0,
        }
    }

    fn value(&self, capability: Capability) -> f32 {
        match capability {
            Capability::CO2 => f32::from(self.co2_ppm),
            Capability::RelativeHumidity => self.humidity_percent,
            _ => self.temperature_c,
        }
    }
}

/// Family members sharing the SCD4x command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Scd40,
    Scd41,
}

impl Variant {
    pub fn chip_name(self) -> &'static str {
        match self {
            Variant::Scd40 => "scd40",
            Variant::Scd41 => "scd41",
        }
    }
}

/// Sensirion SCD40/SCD41 photoacoustic CO2 sensor.
#[derive(Debug)]
pub struct Scd4x {
    address: u8,
    variant: Variant,
    serial_number: u64,
    frame: Frame<Measurement>,
    sampling: SamplingTable,
}

impl Scd4x {
    pub fn probe(bus: &mut dyn BusHandle, address: u8, variant: Variant) -> Result<Self, DriverError> {
        // A previous boot may have left periodic measurement running
        send(bus, address, CMD_STOP_PERIODIC)?;
        bus.delay_ms(STOP_DELAY_MS);

        let serial = read_words::<3>(bus, address, CMD_SERIAL_NUMBER)?;
        let serial_number =
            (u64::from(serial[0]) << 32) | (u64::from(serial[1]) << 16) | u64::from(serial[2]);

        send(bus, address, CMD_START_PERIODIC)?;

        Ok(Self {
            address,
            variant,
            serial_number,
            frame: Frame::empty(),
            sampling: SamplingTable::new(&CAPABILITIES),
        })
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn serial_number(&self) -> u64 {
        self.serial_number
    }

    fn read_measurement(&mut self, bus: &mut dyn BusHandle) -> Result<Option<Measurement>, DriverError> {
        let [status] = read_words::<1>(bus, self.address, CMD_DATA_READY)?;
        if status & DATA_READY_MASK == 0 {
            return Ok(None);
        }
        let measurement = Measurement::from_words(read_words::<3>(bus, self.address, CMD_READ_MEASUREMENT)?);
        debug!(address = self.address, ?measurement, "scd4x measurement");
        Ok(Some(measurement))
    }
}

fn send(bus: &mut dyn BusHandle, address: u8, command: u16) -> Result<(), DriverError> {
    bus.write(address, &sensirion_command(command, None))?;
    Ok(())
}

fn read_words<const N: usize>(
    bus: &mut dyn BusHandle,
    address: u8,
    command: u16,
) -> Result<[u16; N], DriverError> {
    send(bus, address, command)?;
    bus.delay_ms(COMMAND_DELAY_MS);
    let mut frame = [0u8; 9];
    let frame = &mut frame[..N * 3];
    bus.read(address, frame)?;
    sensirion_words::<N>(frame)
}

impl Driver for Scd4x {
    fn chip(&self) -> &'static str {
        self.variant.chip_name()
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
        send(bus, self.address, CMD_STOP_PERIODIC)
    }
}
