use super::{pressure_to_altitude, Capability, Driver, DriverError, SamplingTable};
use crate::bus::BusHandle;
use tracing::debug;

pub const DEFAULT_ADDRESS: u8 = 0x77;
pub const CHIP_ID: u8 = 0x60;

pub const REG_CALIB_TP: u8 = 0x88;
pub const REG_CALIB_H1: u8 = 0xA1;
pub const REG_CHIP_ID: u8 = 0xD0;
pub const REG_RESET: u8 = 0xE0;
pub const REG_CALIB_H2: u8 = 0xE1;
pub const REG_CTRL_HUM: u8 = 0xF2;
pub const REG_STATUS: u8 = 0xF3;
pub const REG_CTRL_MEAS: u8 = 0xF4;
pub const REG_CONFIG: u8 = 0xF5;
pub const REG_DATA: u8 = 0xF7;

const RESET_COMMAND: u8 = 0xB6;
const STATUS_IM_UPDATE: u8 = 0x01;
// x1 oversampling on every channel, normal mode, 1000 ms standby
const CTRL_HUM_X1: u8 = 0x01;
const CTRL_MEAS_NORMAL_X1: u8 = 0x27;
const CONFIG_STANDBY_1000MS: u8 = 0xA0;
const NVM_COPY_RETRIES: u8 = 10;

/// Factory trimming parameters, Bosch datasheet section 4.2.2.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Calibration {
    pub t1: u16,
    pub t2: i16,
    pub t3: i16,
    pub p1: u16,
    pub p2: i16,
    pub p3: i16,
    pub p4: i16,
    pub p5: i16,
    pub p6: i16,
    pub p7: i16,
    pub p8: i16,
    pub p9: i16,
    pub h1: u8,
    pub h2: i16,
    pub h3: u8,
    pub h4: i16,
    pub h5: i16,
    pub h6: i8,
}

impl Calibration {
    pub fn from_registers(tp: &[u8; 24], h1: u8, h: &[u8; 7]) -> Self {
        let u16_at = |i: usize| u16::from_le_bytes([tp[i], tp[i + 1]]);
        let i16_at = |i: usize| i16::from_le_bytes([tp[i], tp[i + 1]]);
        Self {
            t1: u16_at(0),
            t2: i16_at(2),
            t3: i16_at(4),
            p1: u16_at(6),
            p2: i16_at(8),
            p3: i16_at(10),
            p4: i16_at(12),
            p5: i16_at(14),
            p6: i16_at(16),
            p7: i16_at(18),
            p8: i16_at(20),
            p9: i16_at(22),
            h1,
            h2: i16::from_le_bytes([h[0], h[1]]),
            h3: h[2],
            h4: (i16::from(h[3] as i8) << 4) | i16::from(h[4] & 0x0F),
            h5: (i16::from(h[5] as i8) << 4) | i16::from(h[4] >> 4),
            h6: h[6] as i8,
        }
    }

    /// Returns (temperature °C, t_fine).
    pub fn compensate_temperature(&self, adc_t: i32) -> (f32, f64) {
        let adc_t = f64::from(adc_t);
        let t1 = f64::from(self.t1);
        let var1 = (adc_t / 16_384.0 - t1 / 1_024.0) * f64::from(self.t2);
        let delta = adc_t / 131_072.0 - t1 / 8_192.0;
        let var2 = delta * delta * f64::from(self.t3);
        let t_fine = var1 + var2;
        ((t_fine / 5_120.0) as f32, t_fine)
    }

    /// Pressure in Pa, or `None` when the trimming data would divide by zero.
    pub fn compensate_pressure(&self, adc_p: i32, t_fine: f64) -> Option<f64> {
        let mut var1 = t_fine / 2.0 - 64_000.0;
        let mut var2 = var1 * var1 * f64::from(self.p6) / 32_768.0;
        var2 += var1 * f64::from(self.p5) * 2.0;
        var2 = var2 / 4.0 + f64::from(self.p4) * 65_536.0;
        var1 = (f64::from(self.p3) * var1 * var1 / 524_288.0 + f64::from(self.p2) * var1) / 524_288.0;
        var1 = (1.0 + var1 / 32_768.0) * f64::from(self.p1);
        if var1 == 0.0 {
            return None;
        }
        let mut pressure = 1_048_576.0 - f64::from(adc_p);
        pressure = (pressure - var2 / 4_096.0) * 6_250.0 / var1;
        let var1 = f64::from(self.p9) * pressure * pressure / 2_147_483_648.0;
        let var2 = pressure * f64::from(self.p8) / 32_768.0;
        Some(pressure + (var1 + var2 + f64::from(self.p7)) / 16.0)
    }

    pub fn compensate_humidity(&self, adc_h: i32, t_fine: f64) -> f32 {
        let mut h = t_fine - 76_800.0;
        h = (f64::from(adc_h) - (f64::from(self.h4) * 64.0 + f64::from(self.h5) / 16_384.0 * h))
            * (f64::from(self.h2) / 65_536.0
                * (1.0 + f64::from(self.h6) / 67_108_864.0 * h * (1.0 + f64::from(self.h3) / 67_108_864.0 * h)));
        h *= 1.0 - f64::from(self.h1) * h / 524_288.0;
        h.clamp(0.0, 100.0) as f32
    }
}

#[derive(Debug, Clone, Copy)]
struct RawSample {
    pressure: i32,
    temperature: i32,
    humidity: i32,
}

/// Bosch BME280 combined temperature, humidity and pressure sensor.
#[derive(Debug)]
pub struct Bme280 {
    address: u8,
    calibration: Calibration,
    sampling: SamplingTable,
}

impl Bme280 {
    pub fn probe(bus: &mut dyn BusHandle, address: u8) -> Result<Self, DriverError> {
        let chip_id = read_register(bus, address, REG_CHIP_ID)?;
        if chip_id != CHIP_ID {
            return Err(DriverError::WrongChip {
                expected: CHIP_ID,
                found: chip_id,
            });
        }

        bus.write(address, &[REG_RESET, RESET_COMMAND])?;
        bus.delay_ms(10);
        wait_for_nvm_copy(bus, address)?;

        let mut tp = [0u8; 24];
        bus.write_read(address, &[REG_CALIB_TP], &mut tp)?;
        let h1 = read_register(bus, address, REG_CALIB_H1)?;
        let mut h = [0u8; 7];
        bus.write_read(address, &[REG_CALIB_H2], &mut h)?;
        let calibration = Calibration::from_registers(&tp, h1, &h);

        // ctrl_hum only latches after a ctrl_meas write
        bus.write(address, &[REG_CTRL_HUM, CTRL_HUM_X1])?;
        bus.write(address, &[REG_CONFIG, CONFIG_STANDBY_1000MS])?;
        bus.write(address, &[REG_CTRL_MEAS, CTRL_MEAS_NORMAL_X1])?;

        Ok(Self {
            address,
            calibration,
            sampling: SamplingTable::new(&[
                Capability::AmbientTemperature,
                Capability::RelativeHumidity,
                Capability::Pressure,
                Capability::Altitude,
            ]),
        })
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    fn read_raw(&self, bus: &mut dyn BusHandle) -> Result<RawSample, DriverError> {
        let mut data = [0u8; 8];
        bus.write_read(self.address, &[REG_DATA], &mut data)?;
        let twenty_bit = |msb: u8, lsb: u8, xlsb: u8| {
            (i32::from(msb) << 12) | (i32::from(lsb) << 4) | (i32::from(xlsb) >> 4)
        };
        Ok(RawSample {
            pressure: twenty_bit(data[0], data[1], data[2]),
            temperature: twenty_bit(data[3], data[4], data[5]),
            humidity: (i32::from(data[6]) << 8) | i32::from(data[7]),
        })
    }

    fn pressure_hpa(&self, raw: RawSample, t_fine: f64) -> Result<f32, DriverError> {
        self.calibration
            .compensate_pressure(raw.pressure, t_fine)
            .map(|pa| (pa / 100.0) as f32)
            .ok_or(DriverError::Conversion)
    }
}

fn read_register(bus: &mut dyn BusHandle, address: u8, register: u8) -> Result<u8, DriverError> {
    let mut value = [0u8; 1];
    bus.write_read(address, &[register], &mut value)?;
    Ok(value[0])
}

fn wait_for_nvm_copy(bus: &mut dyn BusHandle, address: u8) -> Result<(), DriverError> {
    for _ in 0..NVM_COPY_RETRIES {
        if read_register(bus, address, REG_STATUS)? & STATUS_IM_UPDATE == 0 {
            return Ok(());
        }
        bus.delay_ms(2);
    }
    Err(DriverError::NotReady)
}

impl Driver for Bme280 {
    fn chip(&self) -> &'static str {
        "bme280"
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
        let raw = self.read_raw(bus)?;
        // Humidity and pressure compensation both need t_fine
        let (temperature, t_fine) = self.calibration.compensate_temperature(raw.temperature);
        let value = match capability {
            Capability::AmbientTemperature => temperature,
            Capability::RelativeHumidity => self.calibration.compensate_humidity(raw.humidity, t_fine),
            Capability::Pressure => self.pressure_hpa(raw, t_fine)?,
            _ => pressure_to_altitude(self.pressure_hpa(raw, t_fine)?),
        };
        debug!(address = self.address, %capability, value, "bme280 reading");
        Ok(value)
    }

    fn release(&mut self, bus: &mut dyn BusHandle) -> Result<(), DriverError> {
        // Sleep mode
        bus.write(self.address, &[REG_CTRL_MEAS, CTRL_MEAS_NORMAL_X1 & !0x03])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datasheet_calibration() -> Calibration {
        Calibration {
            t1: 27504,
            t2: 26435,
            t3: -1000,
            p1: 36477,
            p2: -10685,
            p3: 3024,
            p4: 2855,
            p5: 140,
            p6: -7,
            p7: 15500,
            p8: -14600,
            p9: 6000,
            ..Calibration::default()
        }
    }

    #[test]
    fn test_temperature_compensation_datasheet_example() {
        let (temperature, _) = datasheet_calibration().compensate_temperature(519_888);
        assert!((temperature - 25.08).abs() < 0.05, "got {temperature}");
    }

    #[test]
    fn test_pressure_compensation_datasheet_example() {
        let calibration = datasheet_calibration();
        let (_, t_fine) = calibration.compensate_temperature(519_888);
        let pressure = calibration.compensate_pressure(415_148, t_fine).unwrap();
        assert!((pressure / 100.0 - 1006.53).abs() < 1.0, "got {pressure}");
    }

    #[test]
    fn test_pressure_compensation_guards_zero_divisor() {
        let calibration = Calibration::default();
        assert!(calibration.compensate_pressure(415_148, 0.0).is_none());
    }

    #[test]
    fn test_humidity_calibration_nibble_packing() {
        let tp = [0u8; 24];
        let h = [0x6A, 0x01, 0x00, 0x13, 0x2F, 0x03, 0x1E];
        let calibration = Calibration::from_registers(&tp, 75, &h);
        assert_eq!(calibration.h2, 362);
        assert_eq!(calibration.h4, (0x13 << 4) | 0x0F);
        assert_eq!(calibration.h5, (0x03 << 4) | 0x02);
        assert_eq!(calibration.h6, 30);
    }
}
