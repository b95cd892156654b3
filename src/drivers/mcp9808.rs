use super::{Capability, Driver, DriverError, SamplingTable};
use crate::bus::BusHandle;

pub const DEFAULT_ADDRESS: u8 = 0x18;
pub const MANUFACTURER_ID: u16 = 0x0054;
pub const DEVICE_ID: u8 = 0x04;

pub const REG_CONFIG: u8 = 0x01;
pub const REG_AMBIENT: u8 = 0x05;
pub const REG_MANUFACTURER: u8 = 0x06;
pub const REG_DEVICE: u8 = 0x07;

const CONFIG_SHUTDOWN: u16 = 0x0100;

/// Microchip MCP9808 precision temperature sensor.
#[derive(Debug)]
pub struct Mcp9808 {
    address: u8,
    sampling: SamplingTable,
}

impl Mcp9808 {
    pub fn probe(bus: &mut dyn BusHandle, address: u8) -> Result<Self, DriverError> {
        let manufacturer = read_word(bus, address, REG_MANUFACTURER)?;
        if manufacturer != MANUFACTURER_ID {
            return Err(DriverError::WrongChip {
                expected: MANUFACTURER_ID as u8,
                found: manufacturer as u8,
            });
        }
        let device = (read_word(bus, address, REG_DEVICE)? >> 8) as u8;
        if device != DEVICE_ID {
            return Err(DriverError::WrongChip {
                expected: DEVICE_ID,
                found: device,
            });
        }
        // Continuous conversion
        write_word(bus, address, REG_CONFIG, 0x0000)?;

        Ok(Self {
            address,
            sampling: SamplingTable::new(&[Capability::AmbientTemperature]),
        })
    }
}

fn read_word(bus: &mut dyn BusHandle, address: u8, register: u8) -> Result<u16, DriverError> {
    let mut value = [0u8; 2];
    bus.write_read(address, &[register], &mut value)?;
    Ok(u16::from_be_bytes(value))
}

fn write_word(bus: &mut dyn BusHandle, address: u8, register: u8, value: u16) -> Result<(), DriverError> {
    let [high, low] = value.to_be_bytes();
    bus.write(address, &[register, high, low])?;
    Ok(())
}

/// Ambient temperature register to °C; the top three bits are alert flags.
pub fn convert_ambient(raw: u16) -> f32 {
    let magnitude = f32::from(raw & 0x0FFF) / 16.0;
    if raw & 0x1000 != 0 {
        magnitude - 256.0
    } else {
        magnitude
    }
}

impl Driver for Mcp9808 {
    fn chip(&self) -> &'static str {
        "mcp9808"
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
        if capability != Capability::AmbientTemperature {
            return Err(DriverError::Unsupported(capability));
        }
        Ok(convert_ambient(read_word(bus, self.address, REG_AMBIENT)?))
    }

    fn release(&mut self, bus: &mut dyn BusHandle) -> Result<(), DriverError> {
        write_word(bus, self.address, REG_CONFIG, CONFIG_SHUTDOWN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ambient_conversion() {
        assert!((convert_ambient(0x0190) - 25.0).abs() < f32::EPSILON);
        // Alert flags are ignored
        assert!((convert_ambient(0xC190) - 25.0).abs() < f32::EPSILON);
        assert!((convert_ambient(0x1FF0) + 1.0).abs() < f32::EPSILON);
    }
}
