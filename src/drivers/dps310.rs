use super::{pressure_to_altitude, sign_extend, Capability, Driver, DriverError, SamplingTable};
use crate::bus::BusHandle;
use tracing::debug;

pub const DEFAULT_ADDRESS: u8 = 0x77;
pub const PRODUCT_ID: u8 = 0x10;

pub const REG_PSR_B2: u8 = 0x00;
pub const REG_TMP_B2: u8 = 0x03;
pub const REG_PRS_CFG: u8 = 0x06;
pub const REG_TMP_CFG: u8 = 0x07;
pub const REG_MEAS_CFG: u8 = 0x08;
pub const REG_CFG: u8 = 0x09;
pub const REG_RESET: u8 = 0x0C;
pub const REG_PRODUCT_ID: u8 = 0x0D;
pub const REG_COEF: u8 = 0x10;
pub const REG_COEF_SRCE: u8 = 0x28;

pub const MEAS_COEF_READY: u8 = 0x80;
pub const MEAS_SENSOR_READY: u8 = 0x40;
pub const MEAS_TMP_READY: u8 = 0x20;
pub const MEAS_PRS_READY: u8 = 0x10;
const MEAS_CONTINUOUS_BOTH: u8 = 0x07;
const TMP_EXTERNAL_SENSOR: u8 = 0x80;
const SOFT_RESET: u8 = 0x09;

/// Compensation scale factor for single oversampling.
const SCALE_FACTOR_X1: f64 = 524_288.0;
const READY_RETRIES: u8 = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Coefficients {
    pub c0: i32,
    pub c1: i32,
    pub c00: i32,
    pub c10: i32,
    pub c01: i32,
    pub c11: i32,
    pub c20: i32,
    pub c21: i32,
    pub c30: i32,
}

impl Coefficients {
    pub fn from_registers(b: &[u8; 18]) -> Self {
        let u = |i: usize| u32::from(b[i]);
        let word = |i: usize| sign_extend((u(i) << 8) | u(i + 1), 16);
        Self {
            c0: sign_extend((u(0) << 4) | (u(1) >> 4), 12),
            c1: sign_extend(((u(1) & 0x0F) << 8) | u(2), 12),
            c00: sign_extend((u(3) << 12) | (u(4) << 4) | (u(5) >> 4), 20),
            c10: sign_extend(((u(5) & 0x0F) << 16) | (u(6) << 8) | u(7), 20),
            c01: word(8),
            c11: word(10),
            c20: word(12),
            c21: word(14),
            c30: word(16),
        }
    }

    pub fn temperature(&self, raw_temperature: i32) -> f32 {
        let scaled = f64::from(raw_temperature) / SCALE_FACTOR_X1;
        (f64::from(self.c0) * 0.5 + f64::from(self.c1) * scaled) as f32
    }

    /// Compensated pressure in Pa.
    pub fn pressure(&self, raw_pressure: i32, raw_temperature: i32) -> f64 {
        let p = f64::from(raw_pressure) / SCALE_FACTOR_X1;
        let t = f64::from(raw_temperature) / SCALE_FACTOR_X1;
        f64::from(self.c00)
            + p * (f64::from(self.c10) + p * (f64::from(self.c20) + p * f64::from(self.c30)))
            + t * f64::from(self.c01)
            + t * p * (f64::from(self.c11) + p * f64::from(self.c21))
    }
}

/// Infineon DPS310 barometric pressure sensor.
#[derive(Debug)]
pub struct Dps310 {
    address: u8,
    coefficients: Coefficients,
    sampling: SamplingTable,
}

impl Dps310 {
    pub fn probe(bus: &mut dyn BusHandle, address: u8) -> Result<Self, DriverError> {
        let product_id = read_register(bus, address, REG_PRODUCT_ID)?;
        if product_id != PRODUCT_ID {
            return Err(DriverError::WrongChip {
                expected: PRODUCT_ID,
                found: product_id,
            });
        }

        bus.write(address, &[REG_RESET, SOFT_RESET])?;
        bus.delay_ms(10);
        wait_for(bus, address, MEAS_COEF_READY | MEAS_SENSOR_READY)?;

        let mut raw = [0u8; 18];
        bus.write_read(address, &[REG_COEF], &mut raw)?;
        let coefficients = Coefficients::from_registers(&raw);

        // Temperature must be measured with the sensor the coefficients were trimmed against
        let source = read_register(bus, address, REG_COEF_SRCE)? & TMP_EXTERNAL_SENSOR;
        bus.write(address, &[REG_PRS_CFG, 0x00])?;
        bus.write(address, &[REG_TMP_CFG, source])?;
        bus.write(address, &[REG_CFG, 0x00])?;
        bus.write(address, &[REG_MEAS_CFG, MEAS_CONTINUOUS_BOTH])?;

        Ok(Self {
            address,
            coefficients,
            sampling: SamplingTable::new(&[
                Capability::AmbientTemperature,
                Capability::Pressure,
                Capability::Altitude,
            ]),
        })
    }

    pub fn coefficients(&self) -> &Coefficients {
        &self.coefficients
    }

    fn read_raw(&self, bus: &mut dyn BusHandle) -> Result<(i32, i32), DriverError> {
        let status = read_register(bus, self.address, REG_MEAS_CFG)?;
        if status & (MEAS_TMP_READY | MEAS_PRS_READY) != (MEAS_TMP_READY | MEAS_PRS_READY) {
            return Err(DriverError::NotReady);
        }
        let mut data = [0u8; 6];
        bus.write_read(self.address, &[REG_PSR_B2], &mut data)?;
        let twenty_four_bit =
            |b: &[u8]| sign_extend((u32::from(b[0]) << 16) | (u32::from(b[1]) << 8) | u32::from(b[2]), 24);
        Ok((twenty_four_bit(&data[0..3]), twenty_four_bit(&data[3..6])))
    }
}

fn read_register(bus: &mut dyn BusHandle, address: u8, register: u8) -> Result<u8, DriverError> {
    let mut value = [0u8; 1];
    bus.write_read(address, &[register], &mut value)?;
    Ok(value[0])
}

fn wait_for(bus: &mut dyn BusHandle, address: u8, mask: u8) -> Result<(), DriverError> {
    for _ in 0..READY_RETRIES {
        if read_register(bus, address, REG_MEAS_CFG)? & mask == mask {
            return Ok(());
        }
        bus.delay_ms(10);
    }
    Err(DriverError::NotReady)
}

impl Driver for Dps310 {
    fn chip(&self) -> &'static str {
        "dps310"
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
        let (raw_pressure, raw_temperature) = self.read_raw(bus)?;
        let pressure_hpa = (self.coefficients.pressure(raw_pressure, raw_temperature) / 100.0) as f32;
        let value = match capability {
            Capability::AmbientTemperature => self.coefficients.temperature(raw_temperature),
            Capability::Pressure => pressure_hpa,
            _ => pressure_to_altitude(pressure_hpa),
        };
        debug!(address = self.address, %capability, value, "dps310 reading");
        Ok(value)
    }

    fn release(&mut self, bus: &mut dyn BusHandle) -> Result<(), DriverError> {
        // Standby
        bus.write(self.address, &[REG_MEAS_CFG, 0x00])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coefficient_unpacking() {
        // c0 = -1 (0xFFF), c1 = 0x123, c00 = 0x80000 (negative), c10 = 0x00001
        let raw = [
            0xFF, 0xF1, 0x23, 0x80, 0x00, 0x00, 0x00, 0x01, 0xFF, 0xFE, 0x00, 0x10, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00,
        ];
        let coefficients = Coefficients::from_registers(&raw);
        assert_eq!(coefficients.c0, -1);
        assert_eq!(coefficients.c1, 0x123);
        assert_eq!(coefficients.c00, -524_288);
        assert_eq!(coefficients.c10, 1);
        assert_eq!(coefficients.c01, -2);
        assert_eq!(coefficients.c11, 16);
    }

    #[test]
    fn test_temperature_uses_half_c0_offset() {
        let coefficients = Coefficients {
            c0: 50,
            c1: -262,
            ..Coefficients::default()
        };
        assert!((coefficients.temperature(0) - 25.0).abs() < f32::EPSILON);
    }
}
