//! Bus ownership, electrical fault detection, address discovery and the
//! device lifecycle requests that feed the driver registry.

use crate::bus::{
    BusConfig, BusHandle, BusState, BusStatus, Level, LineMode, TransferError, MAX_SEVEN_BIT_ADDRESS,
    SCAN_FIRST_ADDRESS, SCAN_LAST_ADDRESS,
};
use crate::protocol::{DeviceDeinitRequest, DeviceInitRequest, DeviceUpdateRequest, SensorType};
use crate::registry::{ChipCatalog, DriverRegistry, RegistryError};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Time the lines get to settle after enabling pull-ups.
pub const BUS_SETTLE_DELAY_MS: u32 = 150;
pub const MAX_SCAN_RESULTS: usize = (SCAN_LAST_ADDRESS - SCAN_FIRST_ADDRESS + 1) as usize;

pub type ScanAddresses = Vec<u8, MAX_SCAN_RESULTS>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub status: BusStatus,
    pub addresses: ScanAddresses,
}

pub struct BusManager<B: BusHandle> {
    bus: B,
    config: Option<BusConfig>,
    state: BusState,
    registry: DriverRegistry,
    catalog: ChipCatalog,
}

impl<B: BusHandle> BusManager<B> {
    pub fn new(bus: B) -> Self {
        Self::with_catalog(bus, ChipCatalog::builtin())
    }

    pub fn with_catalog(bus: B, catalog: ChipCatalog) -> Self {
        Self {
            bus,
            config: None,
            state: BusState::default(),
            registry: DriverRegistry::new(),
            catalog,
        }
    }

    /// Pre-flight line test followed by transport open.
    ///
    /// A device holding either line low makes opening the transport hang on
    /// some hardware, so the lines are checked in software first.
    pub fn initialize(&mut self, config: BusConfig) -> BusState {
        info!(
            port = config.port,
            sda = config.sda_pin,
            scl = config.scl_pin,
            frequency_hz = config.frequency_hz,
            "initializing bus"
        );
        self.config = Some(config);

        self.bus.configure_line(config.scl_pin, LineMode::PullUp);
        self.bus.configure_line(config.sda_pin, LineMode::PullUp);
        self.bus.delay_ms(BUS_SETTLE_DELAY_MS);

        let scl = self.bus.read_line(config.scl_pin);
        let sda = self.bus.read_line(config.sda_pin);
        if scl == Level::Low || sda == Level::Low {
            error!(?scl, ?sda, "bus line held low, check pull-ups and wiring");
            self.state = BusState {
                initialized: false,
                status: BusStatus::ErrorPullups,
            };
            return self.state;
        }

        self.bus.configure_line(config.scl_pin, LineMode::Floating);
        self.bus.configure_line(config.sda_pin, LineMode::Floating);

        self.state = match self.bus.open(&config) {
            Ok(()) => BusState {
                initialized: true,
                status: BusStatus::Success,
            },
            Err(e) => {
                error!(error = %e, "failed to open bus transport");
                BusState {
                    initialized: false,
                    status: BusStatus::Unspecified,
                }
            }
        };
        self.state
    }

    /// Probe every usable 7-bit address. A hung or shorted bus aborts the
    /// scan; addresses found before the fault are still returned.
    pub fn scan(&mut self) -> ScanResult {
        let mut addresses = ScanAddresses::new();
        if !self.state.initialized {
            warn!("scan requested on an uninitialized bus");
            return ScanResult {
                status: self.state.status,
                addresses,
            };
        }

        let mut status = BusStatus::Success;
        for address in SCAN_FIRST_ADDRESS..=SCAN_LAST_ADDRESS {
            match self.bus.probe(address) {
                Ok(()) => {
                    debug!(address = format_args!("0x{address:02X}"), "found device");
                    let _ = addresses.push(address);
                }
                Err(TransferError::Timeout) => {
                    error!(address = format_args!("0x{address:02X}"), "bus busy during scan, bus presumed hung");
                    status = BusStatus::ErrorHang;
                    break;
                }
                Err(TransferError::Shorted) => {
                    error!(address = format_args!("0x{address:02X}"), "data and clock lines shorted");
                    status = BusStatus::ErrorShorted;
                    break;
                }
                Err(_) => {}
            }
        }

        info!(found = addresses.len(), ?status, "bus scan complete");
        self.state.status = status;
        ScanResult { status, addresses }
    }

    pub fn init_device(&mut self, request: &DeviceInitRequest) -> bool {
        match self.try_init_device(request) {
            Ok(()) => {
                self.state.status = BusStatus::Success;
                true
            }
            Err(status) => {
                self.state.status = status;
                false
            }
        }
    }

    fn try_init_device(&mut self, request: &DeviceInitRequest) -> Result<(), BusStatus> {
        let address = request.address;
        let chip = request.chip_name.as_str();

        if address > MAX_SEVEN_BIT_ADDRESS {
            warn!(address, chip, "device address outside 7-bit range");
            return Err(BusStatus::DeviceInitFail);
        }
        if !self.state.initialized {
            warn!(address, chip, "device init requested on an uninitialized bus");
            return Err(BusStatus::DeviceInitFail);
        }
        if self.registry.contains(address) {
            warn!(address, chip, "address already has a registered driver");
            return Err(BusStatus::DeviceAlreadyInitialized);
        }
        let Some(constructor) = self.catalog.lookup(chip) else {
            warn!(address, chip, "unsupported chip");
            return Err(BusStatus::UnsupportedDevice);
        };

        let mut driver = constructor(&mut self.bus, address).map_err(|e| {
            error!(address, chip, error = %e, "failed to initialize device");
            BusStatus::DeviceInitFail
        })?;

        for entry in &request.capability_periods {
            match entry.sensor_type {
                SensorType::Known(capability) => {
                    if !driver.set_period(capability, entry.period_ms) {
                        debug!(address, chip, %capability, "capability not provided by chip, ignoring period");
                    }
                }
                SensorType::Unrecognized(ref tag) => {
                    warn!(address, chip, tag = %tag, "ignoring unrecognized sensor type");
                }
            }
        }

        self.registry.insert(driver).map_err(|e| {
            error!(address, chip, error = %e, "failed to register driver");
            match e {
                RegistryError::AddressInUse(_) => BusStatus::DeviceAlreadyInitialized,
                RegistryError::Full => BusStatus::DeviceInitFail,
            }
        })?;

        info!(address = format_args!("0x{address:02X}"), chip, "device initialized");
        Ok(())
    }

    /// Apply period changes. Unknown addresses are a no-op.
    pub fn update_device(&mut self, request: &DeviceUpdateRequest) -> BusStatus {
        let mut status = BusStatus::Success;
        if let Some(driver) = self.registry.get_mut(request.address) {
            for entry in &request.capability_periods {
                match entry.sensor_type {
                    SensorType::Known(capability) => {
                        if driver.set_period(capability, entry.period_ms) {
                            debug!(address = request.address, %capability, period_ms = entry.period_ms, "period updated");
                        } else {
                            debug!(address = request.address, %capability, "capability not provided by chip, ignoring period");
                        }
                    }
                    SensorType::Unrecognized(ref tag) => {
                        warn!(address = request.address, tag = %tag, "unable to determine sensor type");
                        status = BusStatus::UnsupportedDevice;
                    }
                }
            }
        } else {
            debug!(address = request.address, "update for unregistered address ignored");
        }
        self.state.status = status;
        status
    }

    pub fn deinit_device(&mut self, request: &DeviceDeinitRequest) -> BusStatus {
        if let Some(mut driver) = self.registry.remove(request.address) {
            if let Err(e) = driver.release(&mut self.bus) {
                warn!(address = request.address, error = %e, "driver release failed");
            }
            info!(address = format_args!("0x{:02X}", request.address), chip = driver.chip(), "device deinitialized");
        }
        self.state.status = BusStatus::Success;
        self.state.status
    }

    /// Release every driver and mark the bus closed.
    pub fn teardown(&mut self) {
        for mut driver in self.registry.drain() {
            if let Err(e) = driver.release(&mut self.bus) {
                warn!(address = driver.address(), error = %e, "driver release failed during teardown");
            }
        }
        self.state.initialized = false;
        info!("bus torn down");
    }

    pub fn state(&self) -> BusState {
        self.state
    }

    pub fn status(&self) -> BusStatus {
        self.state.status
    }

    pub fn is_initialized(&self) -> bool {
        self.state.initialized
    }

    pub fn config(&self) -> Option<&BusConfig> {
        self.config.as_ref()
    }

    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    pub fn catalog_mut(&mut self) -> &mut ChipCatalog {
        &mut self.catalog
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Split borrow used by the scheduler: drivers sample against the bus
    /// the manager owns.
    pub fn parts_mut(&mut self) -> (&mut B, &mut DriverRegistry) {
        (&mut self.bus, &mut self.registry)
    }
}
