//! Register-level models of the supported chips.
//!
//! Trimming values are chosen so the compensation maths reduce to linear
//! functions, which keeps the raw encodings exact inverses of the drivers.

use super::{Environment, SimDevice};
use crate::bus::TransferError;
use crate::drivers::{bme280, crc8, dps310, mcp9808, scd30, scd4x};
use heapless::Vec;

/// Byte-addressed register space with an auto-incrementing pointer.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    bytes: [u8; 256],
    pointer: u8,
}

impl RegisterFile {
    pub fn new() -> Self {
        Self {
            bytes: [0; 256],
            pointer: 0,
        }
    }

    pub fn get(&self, register: u8) -> u8 {
        self.bytes[usize::from(register)]
    }

    pub fn set(&mut self, register: u8, value: u8) {
        self.bytes[usize::from(register)] = value;
    }

    pub fn load(&mut self, start: u8, values: &[u8]) {
        for (offset, value) in values.iter().enumerate() {
            self.bytes[usize::from(start.wrapping_add(offset as u8))] = *value;
        }
    }

    /// First byte selects the register, the rest are written from there.
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransferError> {
        let (&register, data) = bytes.split_first().ok_or(TransferError::DataNack)?;
        self.pointer = register;
        self.load(register, data);
        Ok(())
    }

    fn read(&mut self, buffer: &mut [u8]) {
        for byte in buffer {
            *byte = self.get(self.pointer);
            self.pointer = self.pointer.wrapping_add(1);
        }
    }
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

/// Acknowledges its address and reads back zeros. Stands in for chips the
/// crate has no driver for.
#[derive(Debug, Clone, Copy, Default)]
pub struct AckOnlyDevice;

impl SimDevice for AckOnlyDevice {
    fn write(&mut self, _environment: &Environment, _bytes: &[u8]) -> Result<(), TransferError> {
        Ok(())
    }

    fn read(&mut self, _environment: &Environment, buffer: &mut [u8]) -> Result<(), TransferError> {
        buffer.fill(0);
        Ok(())
    }
}

fn scale(value: f32, full_scale: f32, counts: f32) -> u32 {
    (value / full_scale * counts).round().clamp(0.0, counts - 1.0) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AhtPending {
    Status,
    Measurement,
}

#[derive(Debug, Clone)]
pub struct Aht20Model {
    calibrated: bool,
    pending: AhtPending,
}

impl Aht20Model {
    /// Comes up uncalibrated so the driver has to send the init command.
    pub fn new() -> Self {
        Self {
            calibrated: false,
            pending: AhtPending::Status,
        }
    }

    fn status(&self) -> u8 {
        0x10 | if self.calibrated { 0x08 } else { 0x00 }
    }

    fn frame(&self, environment: &Environment) -> [u8; 7] {
        const COUNTS: f32 = 1_048_576.0;
        let humidity = scale(environment.humidity_percent, 100.0, COUNTS);
        let temperature = scale(environment.temperature_c + 50.0, 200.0, COUNTS);
        let mut frame = [
            self.status(),
            (humidity >> 12) as u8,
            (humidity >> 4) as u8,
            (((humidity & 0x0F) << 4) | (temperature >> 16)) as u8,
            (temperature >> 8) as u8,
            temperature as u8,
            0,
        ];
        frame[6] = crc8(&frame[..6]);
        frame
    }
}

impl Default for Aht20Model {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDevice for Aht20Model {
    fn write(&mut self, _environment: &Environment, bytes: &[u8]) -> Result<(), TransferError> {
        match bytes {
            [0xBA] | [0x71] => self.pending = AhtPending::Status,
            [0xBE, ..] => {
                self.calibrated = true;
                self.pending = AhtPending::Status;
            }
            [0xAC, 0x33, 0x00] => self.pending = AhtPending::Measurement,
            _ => return Err(TransferError::DataNack),
        }
        Ok(())
    }

    fn read(&mut self, environment: &Environment, buffer: &mut [u8]) -> Result<(), TransferError> {
        match self.pending {
            AhtPending::Status => buffer.fill(self.status()),
            AhtPending::Measurement => {
                let frame = self.frame(environment);
                for (byte, value) in buffer.iter_mut().zip(frame.iter().chain(core::iter::repeat(&0))) {
                    *byte = *value;
                }
                self.pending = AhtPending::Status;
            }
        }
        Ok(())
    }
}

// Linearised BME280 trimming: t3 and every pressure term but p1 are zero,
// humidity only keeps h2.
const BME_T1: u16 = 27_504;
const BME_T2: i16 = 26_435;
const BME_P1: u16 = 36_477;
const BME_H2: i16 = 362;

#[derive(Debug, Clone)]
pub struct Bme280Model {
    registers: RegisterFile,
}

impl Bme280Model {
    pub fn new() -> Self {
        let mut registers = RegisterFile::new();
        registers.set(bme280::REG_CHIP_ID, bme280::CHIP_ID);

        let mut tp = [0u8; 24];
        tp[0..2].copy_from_slice(&BME_T1.to_le_bytes());
        tp[2..4].copy_from_slice(&BME_T2.to_le_bytes());
        tp[6..8].copy_from_slice(&BME_P1.to_le_bytes());
        registers.load(bme280::REG_CALIB_TP, &tp);
        registers.set(bme280::REG_CALIB_H1, 0);
        let h2 = BME_H2.to_le_bytes();
        registers.load(bme280::REG_CALIB_H2, &[h2[0], h2[1], 0, 0, 0, 0, 0]);
        Self { registers }
    }

    fn refresh(&mut self, environment: &Environment) {
        let t1 = f64::from(BME_T1);
        let t_fine = f64::from(environment.temperature_c) * 5_120.0;
        let adc_t = ((t_fine / f64::from(BME_T2) + t1 / 1_024.0) * 16_384.0).round() as u32;
        let pressure_pa = f64::from(environment.pressure_hpa) * 100.0;
        let adc_p = (1_048_576.0 - pressure_pa * f64::from(BME_P1) / 6_250.0).round() as u32;
        let adc_h = (f64::from(environment.humidity_percent) * 65_536.0 / f64::from(BME_H2)).round() as u16;

        let twenty_bit = |raw: u32| [(raw >> 12) as u8, (raw >> 4) as u8, ((raw & 0x0F) << 4) as u8];
        let [p0, p1, p2] = twenty_bit(adc_p);
        let [t0, t1, t2] = twenty_bit(adc_t);
        let [h0, h1] = adc_h.to_be_bytes();
        self.registers.load(bme280::REG_DATA, &[p0, p1, p2, t0, t1, t2, h0, h1]);
    }
}

impl Default for Bme280Model {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDevice for Bme280Model {
    fn write(&mut self, environment: &Environment, bytes: &[u8]) -> Result<(), TransferError> {
        self.registers.write(bytes)?;
        if bytes == [bme280::REG_RESET, 0xB6] {
            self.registers.set(bme280::REG_CTRL_MEAS, 0);
            self.registers.set(bme280::REG_RESET, 0);
        }
        self.refresh(environment);
        Ok(())
    }

    fn read(&mut self, _environment: &Environment, buffer: &mut [u8]) -> Result<(), TransferError> {
        self.registers.read(buffer);
        Ok(())
    }

    fn is_sleeping(&self) -> bool {
        self.registers.get(bme280::REG_CTRL_MEAS) & 0x03 == 0
    }
}

// T = c1 * t_raw / kT and P = c10 * p_raw / kP, c0 and the rest zero.
const DPS_C1: i32 = 1_000;
const DPS_C10: i32 = 200_000;
const DPS_SCALE: f64 = 524_288.0;

#[derive(Debug, Clone)]
pub struct Dps310Model {
    registers: RegisterFile,
}

impl Dps310Model {
    pub fn new() -> Self {
        let mut registers = RegisterFile::new();
        registers.set(dps310::REG_PRODUCT_ID, dps310::PRODUCT_ID);
        registers.set(dps310::REG_COEF_SRCE, 0x80);

        let c1 = DPS_C1 as u32 & 0x0FFF;
        let c10 = DPS_C10 as u32 & 0x000F_FFFF;
        let mut coef = [0u8; 18];
        coef[1] = (c1 >> 8) as u8;
        coef[2] = c1 as u8;
        coef[5] = (c10 >> 16) as u8;
        coef[6] = (c10 >> 8) as u8;
        coef[7] = c10 as u8;
        registers.load(dps310::REG_COEF, &coef);
        Self { registers }
    }

    fn running(&self) -> bool {
        self.registers.get(dps310::REG_MEAS_CFG) & 0x07 == 0x07
    }

    fn refresh(&mut self, environment: &Environment) {
        let mut status = dps310::MEAS_COEF_READY | dps310::MEAS_SENSOR_READY;
        if self.running() {
            status |= dps310::MEAS_TMP_READY | dps310::MEAS_PRS_READY;
        }
        let mode = self.registers.get(dps310::REG_MEAS_CFG) & 0x07;
        self.registers.set(dps310::REG_MEAS_CFG, status | mode);

        let raw_t = (f64::from(environment.temperature_c) / f64::from(DPS_C1) * DPS_SCALE).round() as i32;
        let raw_p =
            (f64::from(environment.pressure_hpa) * 100.0 / f64::from(DPS_C10) * DPS_SCALE).round() as i32;
        let bytes = |raw: i32| {
            let raw = raw as u32 & 0x00FF_FFFF;
            [(raw >> 16) as u8, (raw >> 8) as u8, raw as u8]
        };
        let [p0, p1, p2] = bytes(raw_p);
        let [t0, t1, t2] = bytes(raw_t);
        self.registers.load(dps310::REG_PSR_B2, &[p0, p1, p2, t0, t1, t2]);
    }
}

impl Default for Dps310Model {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDevice for Dps310Model {
    fn write(&mut self, environment: &Environment, bytes: &[u8]) -> Result<(), TransferError> {
        self.registers.write(bytes)?;
        if bytes == [dps310::REG_RESET, 0x09] {
            self.registers.set(dps310::REG_MEAS_CFG, 0);
            self.registers.set(dps310::REG_RESET, 0);
        }
        self.refresh(environment);
        Ok(())
    }

    fn read(&mut self, _environment: &Environment, buffer: &mut [u8]) -> Result<(), TransferError> {
        self.registers.read(buffer);
        Ok(())
    }

    fn is_sleeping(&self) -> bool {
        !self.running()
    }
}

/// Word registers, big-endian on the wire.
#[derive(Debug, Clone)]
pub struct Mcp9808Model {
    registers: [u16; 16],
    pointer: usize,
}

impl Mcp9808Model {
    pub fn new() -> Self {
        let mut registers = [0u16; 16];
        registers[usize::from(mcp9808::REG_MANUFACTURER)] = mcp9808::MANUFACTURER_ID;
        registers[usize::from(mcp9808::REG_DEVICE)] = u16::from(mcp9808::DEVICE_ID) << 8;
        Self { registers, pointer: 0 }
    }

    fn ambient(environment: &Environment) -> u16 {
        let sixteenths = (environment.temperature_c * 16.0).round() as i32;
        (sixteenths as u16) & 0x1FFF
    }
}

impl Default for Mcp9808Model {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDevice for Mcp9808Model {
    fn write(&mut self, _environment: &Environment, bytes: &[u8]) -> Result<(), TransferError> {
        let (&register, data) = bytes.split_first().ok_or(TransferError::DataNack)?;
        let register = usize::from(register);
        if register >= self.registers.len() {
            return Err(TransferError::DataNack);
        }
        self.pointer = register;
        if let [high, low] = data {
            self.registers[register] = u16::from_be_bytes([*high, *low]);
        }
        Ok(())
    }

    fn read(&mut self, environment: &Environment, buffer: &mut [u8]) -> Result<(), TransferError> {
        let value = if self.pointer == usize::from(mcp9808::REG_AMBIENT) {
            Self::ambient(environment)
        } else {
            self.registers[self.pointer]
        };
        for (byte, value) in buffer.iter_mut().zip(value.to_be_bytes()) {
            *byte = value;
        }
        Ok(())
    }

    fn is_sleeping(&self) -> bool {
        self.registers[usize::from(mcp9808::REG_CONFIG)] & 0x0100 != 0
    }
}

type Words = Vec<u16, 6>;

/// Split a Sensirion write into command and optional CRC-checked argument.
fn parse_command(bytes: &[u8]) -> Result<(u16, Option<u16>), TransferError> {
    match bytes {
        [high, low] => Ok((u16::from_be_bytes([*high, *low]), None)),
        [high, low, a, b, crc] => {
            if crc8(&[*a, *b]) != *crc {
                return Err(TransferError::DataNack);
            }
            Ok((u16::from_be_bytes([*high, *low]), Some(u16::from_be_bytes([*a, *b]))))
        }
        _ => Err(TransferError::DataNack),
    }
}

/// Serve a pending word response, one CRC per word.
fn read_words(pending: &mut Option<Words>, buffer: &mut [u8]) -> Result<(), TransferError> {
    let words = pending.take().ok_or(TransferError::DataNack)?;
    if buffer.len() > words.len() * 3 {
        return Err(TransferError::DataNack);
    }
    for (chunk, word) in buffer.chunks_mut(3).zip(words.iter()) {
        let [high, low] = word.to_be_bytes();
        let frame = [high, low, crc8(&[high, low])];
        chunk.copy_from_slice(&frame[..chunk.len()]);
    }
    Ok(())
}

fn words(values: &[u16]) -> Option<Words> {
    Vec::from_slice(values).ok()
}

#[derive(Debug, Clone)]
pub struct Scd30Model {
    running: bool,
    interval_s: u16,
    pending: Option<Words>,
}

impl Scd30Model {
    pub const FIRMWARE_VERSION: u16 = 0x0342;

    pub fn new() -> Self {
        Self {
            running: false,
            interval_s: 2,
            pending: None,
        }
    }

    pub fn interval_s(&self) -> u16 {
        self.interval_s
    }

    fn measurement(environment: &Environment) -> Option<Words> {
        let mut out = Words::new();
        for value in [environment.co2_ppm, environment.temperature_c, environment.humidity_percent] {
            let bits = value.to_bits();
            out.push((bits >> 16) as u16).ok()?;
            out.push(bits as u16).ok()?;
        }
        Some(out)
    }
}

impl Default for Scd30Model {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDevice for Scd30Model {
    fn write(&mut self, environment: &Environment, bytes: &[u8]) -> Result<(), TransferError> {
        let (command, argument) = parse_command(bytes)?;
        self.pending = match command {
            scd30::CMD_FIRMWARE_VERSION => words(&[Self::FIRMWARE_VERSION]),
            scd30::CMD_MEASUREMENT_INTERVAL => {
                if let Some(interval) = argument {
                    self.interval_s = interval;
                }
                None
            }
            scd30::CMD_START_CONTINUOUS => {
                self.running = true;
                None
            }
            scd30::CMD_STOP_CONTINUOUS => {
                self.running = false;
                None
            }
            scd30::CMD_DATA_READY => words(&[u16::from(self.running)]),
            scd30::CMD_READ_MEASUREMENT if self.running => Self::measurement(environment),
            _ => return Err(TransferError::DataNack),
        };
        Ok(())
    }

    fn read(&mut self, _environment: &Environment, buffer: &mut [u8]) -> Result<(), TransferError> {
        read_words(&mut self.pending, buffer)
    }

    fn is_sleeping(&self) -> bool {
        !self.running
    }
}

#[derive(Debug, Clone)]
pub struct Scd4xModel {
    running: bool,
    serial: [u16; 3],
    pending: Option<Words>,
}

impl Scd4xModel {
    pub fn new() -> Self {
        Self {
            running: false,
            serial: [0xF896, 0x9F07, 0x3BB7],
            pending: None,
        }
    }

    fn measurement(environment: &Environment) -> Option<Words> {
        let co2 = environment.co2_ppm.round().clamp(0.0, 65_535.0) as u16;
        let temperature = scale(environment.temperature_c + 45.0, 175.0, 65_536.0) as u16;
        let humidity = scale(environment.humidity_percent, 100.0, 65_536.0) as u16;
        words(&[co2, temperature, humidity])
    }
}

impl Default for Scd4xModel {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDevice for Scd4xModel {
    fn write(&mut self, environment: &Environment, bytes: &[u8]) -> Result<(), TransferError> {
        let (command, _) = parse_command(bytes)?;
        self.pending = match command {
            scd4x::CMD_STOP_PERIODIC => {
                self.running = false;
                None
            }
            // Serial number is only readable while idle
            scd4x::CMD_SERIAL_NUMBER if !self.running => words(&self.serial),
            scd4x::CMD_START_PERIODIC => {
                self.running = true;
                None
            }
            scd4x::CMD_DATA_READY => words(&[if self.running { 0x8006 } else { 0x8000 }]),
            scd4x::CMD_READ_MEASUREMENT if self.running => Self::measurement(environment),
            _ => return Err(TransferError::DataNack),
        };
        Ok(())
    }

    fn read(&mut self, _environment: &Environment, buffer: &mut [u8]) -> Result<(), TransferError> {
        read_words(&mut self.pending, buffer)
    }

    fn is_sleeping(&self) -> bool {
        !self.running
    }
}
