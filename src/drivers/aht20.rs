use super::{crc8, Capability, Driver, DriverError, SamplingTable};
use crate::bus::BusHandle;
use tracing::debug;

pub const DEFAULT_ADDRESS: u8 = 0x38;

const CMD_STATUS: u8 = 0x71;
const CMD_CALIBRATE: [u8; 3] = [0xBE, 0x08, 0x00];
const CMD_TRIGGER: [u8; 3] = [0xAC, 0x33, 0x00];
const CMD_SOFT_RESET: u8 = 0xBA;

const STATUS_BUSY: u8 = 0x80;
const STATUS_CALIBRATED: u8 = 0x08;

const MEASUREMENT_DELAY_MS: u32 = 80;
const CALIBRATION_DELAY_MS: u32 = 10;
const RESET_DELAY_MS: u32 = 20;

/// Aosong AHT20 temperature and humidity sensor.
#[derive(Debug)]
pub struct Aht20 {
    address: u8,
    sampling: SamplingTable,
}

impl Aht20 {
    pub fn probe(bus: &mut dyn BusHandle, address: u8) -> Result<Self, DriverError> {
        bus.write(address, &[CMD_SOFT_RESET])?;
        bus.delay_ms(RESET_DELAY_MS);

        if read_status(bus, address)? & STATUS_CALIBRATED == 0 {
            bus.write(address, &CMD_CALIBRATE)?;
            bus.delay_ms(CALIBRATION_DELAY_MS);
            if read_status(bus, address)? & STATUS_CALIBRATED == 0 {
                return Err(DriverError::NotReady);
            }
        }

        Ok(Self {
            address,
            sampling: SamplingTable::new(&[Capability::AmbientTemperature, Capability::RelativeHumidity]),
        })
    }

    /// Trigger a conversion and return (temperature °C, humidity %RH).
    fn measure(&self, bus: &mut dyn BusHandle) -> Result<(f32, f32), DriverError> {
        bus.write(self.address, &CMD_TRIGGER)?;
        bus.delay_ms(MEASUREMENT_DELAY_MS);

        let mut frame = [0u8; 7];
        bus.read(self.address, &mut frame)?;
        if frame[0] & STATUS_BUSY != 0 {
            return Err(DriverError::NotReady);
        }
        if crc8(&frame[..6]) != frame[6] {
            return Err(DriverError::Checksum);
        }
        Ok(convert(&frame))
    }
}

fn read_status(bus: &mut dyn BusHandle, address: u8) -> Result<u8, DriverError> {
    let mut status = [0u8; 1];
    bus.write_read(address, &[CMD_STATUS], &mut status)?;
    Ok(status[0])
}

fn convert(frame: &[u8; 7]) -> (f32, f32) {
    let raw_humidity =
        (u32::from(frame[1]) << 12) | (u32::from(frame[2]) << 4) | (u32::from(frame[3]) >> 4);
    let raw_temperature =
        ((u32::from(frame[3]) & 0x0F) << 16) | (u32::from(frame[4]) << 8) | u32::from(frame[5]);

    let humidity = raw_humidity as f32 / 1_048_576.0 * 100.0;
    let temperature = raw_temperature as f32 / 1_048_576.0 * 200.0 - 50.0;
    (temperature, humidity)
}

impl Driver for Aht20 {
    fn chip(&self) -> &'static str {
        "aht20"
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
        let (temperature, humidity) = self.measure(bus)?;
        debug!(address = self.address, temperature, humidity, "aht20 measurement");
        Ok(match capability {
            Capability::RelativeHumidity => humidity,
            _ => temperature,
        })
    }
}
