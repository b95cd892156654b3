//! In-memory two-wire bus with register-level chip models.
//!
//! Backs the integration tests and the host bridge binary. Chip models derive
//! their raw readings from a shared [`Environment`], so a reading published
//! by the scheduler can be traced back to the physical value that produced it.

pub mod chips;

pub use chips::{AckOnlyDevice, Aht20Model, Bme280Model, Dps310Model, Mcp9808Model, Scd30Model, Scd4xModel};

use crate::bus::{BusConfig, BusHandle, Level, LineMode, TransferError};
use heapless::{FnvIndexMap, Vec};
use serde::{Deserialize, Serialize};
use tracing::trace;

pub const MAX_SIM_DEVICES: usize = 16;
const MAX_LINES: usize = 8;

/// Physical conditions every simulated chip measures.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub temperature_c: f32,
    pub humidity_percent: f32,
    pub pressure_hpa: f32,
    pub co2_ppm: f32,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            temperature_c: 22.5,
            humidity_percent: 45.0,
            pressure_hpa: 1013.25,
            co2_ppm: 600.0,
        }
    }
}

/// A chip attached to the simulated bus.
pub trait SimDevice: Send {
    fn write(&mut self, environment: &Environment, bytes: &[u8]) -> Result<(), TransferError>;

    fn read(&mut self, environment: &Environment, buffer: &mut [u8]) -> Result<(), TransferError>;

    /// True once the chip has been put into its idle or shutdown state.
    fn is_sleeping(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InjectedFault {
    error: TransferError,
    /// Transactions left before the fault clears; `None` never clears.
    remaining: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SimStats {
    pub transactions: u32,
    pub failed_transactions: u32,
    pub injected_faults_fired: u32,
    pub elapsed_delay_ms: u64,
}

pub struct SimulatedBus {
    environment: Environment,
    devices: FnvIndexMap<u8, Box<dyn SimDevice>, MAX_SIM_DEVICES>,
    faults: FnvIndexMap<u8, InjectedFault, MAX_SIM_DEVICES>,
    line_modes: FnvIndexMap<u8, LineMode, MAX_LINES>,
    held_low: Vec<u8, MAX_LINES>,
    open_error: Option<TransferError>,
    opened: Option<BusConfig>,
    stats: SimStats,
    rng_state: u64,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self {
            environment: Environment::default(),
            devices: FnvIndexMap::new(),
            faults: FnvIndexMap::new(),
            line_modes: FnvIndexMap::new(),
            held_low: Vec::new(),
            open_error: None,
            opened: None,
            stats: SimStats::default(),
            rng_state: 0x1234_5678_9ABC_DEF0,
        }
    }

    /// A bus populated with one of each supported chip at its default
    /// address (the DPS310 is moved to 0x76 to avoid the BME280).
    pub fn with_default_chips() -> Self {
        let mut bus = Self::new();
        let _ = bus.attach(0x38, Box::new(Aht20Model::new()));
        let _ = bus.attach(0x77, Box::new(Bme280Model::new()));
        let _ = bus.attach(0x76, Box::new(Dps310Model::new()));
        let _ = bus.attach(0x18, Box::new(Mcp9808Model::new()));
        let _ = bus.attach(0x61, Box::new(Scd30Model::new()));
        let _ = bus.attach(0x62, Box::new(Scd4xModel::new()));
        bus
    }

    /// Returns the rejected device if the bus already has too many attached.
    pub fn attach(&mut self, address: u8, device: Box<dyn SimDevice>) -> Result<(), Box<dyn SimDevice>> {
        self.devices
            .insert(address, device)
            .map(|_| ())
            .map_err(|(_, device)| device)
    }

    pub fn detach(&mut self, address: u8) -> Option<Box<dyn SimDevice>> {
        self.devices.remove(&address)
    }

    pub fn device(&self, address: u8) -> Option<&dyn SimDevice> {
        self.devices.get(&address).map(|device| &**device)
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn environment_mut(&mut self) -> &mut Environment {
        &mut self.environment
    }

    /// Let the environment wander a little, deterministically.
    pub fn drift(&mut self) {
        let step = |state: &mut u64| {
            *state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            ((*state >> 33) as f32 / (u32::MAX >> 1) as f32) - 0.5
        };
        let env = &mut self.environment;
        env.temperature_c = (env.temperature_c + step(&mut self.rng_state) * 0.2).clamp(-10.0, 50.0);
        env.humidity_percent = (env.humidity_percent + step(&mut self.rng_state)).clamp(5.0, 95.0);
        env.pressure_hpa = (env.pressure_hpa + step(&mut self.rng_state) * 0.5).clamp(950.0, 1050.0);
        env.co2_ppm = (env.co2_ppm + step(&mut self.rng_state) * 20.0).clamp(400.0, 5000.0);
    }

    /// Hold a line low, as a missing pull-up or a stuck device would.
    pub fn hold_line_low(&mut self, pin: u8) {
        if !self.held_low.contains(&pin) {
            let _ = self.held_low.push(pin);
        }
    }

    pub fn release_line(&mut self, pin: u8) {
        self.held_low.retain(|held| *held != pin);
    }

    pub fn line_mode(&self, pin: u8) -> Option<LineMode> {
        self.line_modes.get(&pin).copied()
    }

    pub fn fail_open(&mut self, error: Option<TransferError>) {
        self.open_error = error;
    }

    pub fn opened_with(&self) -> Option<&BusConfig> {
        self.opened.as_ref()
    }

    /// Every transaction addressed to `address` fails until cleared.
    pub fn fail_always(&mut self, address: u8, error: TransferError) {
        let _ = self.faults.insert(address, InjectedFault { error, remaining: None });
    }

    /// The next `count` transactions addressed to `address` fail.
    pub fn fail_next(&mut self, address: u8, error: TransferError, count: u32) {
        let _ = self.faults.insert(
            address,
            InjectedFault {
                error,
                remaining: Some(count),
            },
        );
    }

    pub fn clear_faults(&mut self) {
        self.faults.clear();
    }

    pub fn stats(&self) -> &SimStats {
        &self.stats
    }

    fn check_fault(&mut self, address: u8) -> Result<(), TransferError> {
        let (error, exhausted) = {
            let Some(fault) = self.faults.get_mut(&address) else {
                return Ok(());
            };
            match &mut fault.remaining {
                None => (Some(fault.error), false),
                Some(0) => (None, true),
                Some(remaining) => {
                    *remaining -= 1;
                    (Some(fault.error), *remaining == 0)
                }
            }
        };
        if exhausted {
            self.faults.remove(&address);
        }
        match error {
            Some(error) => {
                self.stats.injected_faults_fired += 1;
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn transaction<F>(&mut self, address: u8, op: F) -> Result<(), TransferError>
    where
        F: FnOnce(&mut dyn SimDevice, &Environment) -> Result<(), TransferError>,
    {
        self.stats.transactions += 1;
        let result = self.check_fault(address).and_then(|()| {
            let environment = self.environment;
            match self.devices.get_mut(&address) {
                Some(device) => op(device.as_mut(), &environment),
                None => Err(TransferError::AddressNack),
            }
        });
        if let Err(e) = result {
            trace!(address, error = %e, "simulated transfer failed");
            self.stats.failed_transactions += 1;
        }
        result
    }
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for SimulatedBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimulatedBus")
            .field("devices", &self.devices.keys().collect::<Vec<_, MAX_SIM_DEVICES>>())
            .field("environment", &self.environment)
            .field("opened", &self.opened)
            .field("stats", &self.stats)
            .finish()
    }
}

impl BusHandle for SimulatedBus {
    fn configure_line(&mut self, pin: u8, mode: LineMode) {
        let _ = self.line_modes.insert(pin, mode);
    }

    fn read_line(&mut self, pin: u8) -> Level {
        if self.held_low.contains(&pin) {
            Level::Low
        } else {
            Level::High
        }
    }

    fn open(&mut self, config: &BusConfig) -> Result<(), TransferError> {
        if let Some(error) = self.open_error {
            return Err(error);
        }
        self.opened = Some(*config);
        Ok(())
    }

    fn probe(&mut self, address: u8) -> Result<(), TransferError> {
        self.transaction(address, |_, _| Ok(()))
    }

    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), TransferError> {
        self.transaction(address, |device, environment| device.write(environment, bytes))
    }

    fn read(&mut self, address: u8, buffer: &mut [u8]) -> Result<(), TransferError> {
        self.transaction(address, |device, environment| device.read(environment, buffer))
    }

    fn delay_ms(&mut self, ms: u32) {
        self.stats.elapsed_delay_ms += u64::from(ms);
    }
}
