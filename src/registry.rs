//! Live driver storage keyed by bus address, and the chip-name catalog used
//! to construct drivers.

use crate::bus::BusHandle;
use crate::drivers::scd4x::Variant;
use crate::drivers::{Aht20, Bme280, Dps310, Driver, DriverError, Mcp9808, Scd30, Scd4x};
use heapless::{FnvIndexMap, Vec};
use static_assertions::const_assert;
use thiserror::Error;

pub const MAX_DRIVERS: usize = 16;
pub const MAX_CHIP_TYPES: usize = 16;

const_assert!(MAX_DRIVERS.is_power_of_two());

pub type BoxedDriver = Box<dyn Driver + Send>;

/// Probes the chip at `address` and returns a ready driver.
pub type DriverConstructor = fn(&mut dyn BusHandle, u8) -> Result<BoxedDriver, DriverError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("a driver is already registered at address 0x{0:02X}")]
    AddressInUse(u8),
    #[error("driver registry is full")]
    Full,
}

/// Owns every live driver. At most one driver per address.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: FnvIndexMap<u8, BoxedDriver, MAX_DRIVERS>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, driver: BoxedDriver) -> Result<(), RegistryError> {
        let address = driver.address();
        if self.drivers.contains_key(&address) {
            return Err(RegistryError::AddressInUse(address));
        }
        self.drivers
            .insert(address, driver)
            .map(|_| ())
            .map_err(|_| RegistryError::Full)
    }

    /// Remove a driver. The last driver takes the freed slot in iteration
    /// order.
    pub fn remove(&mut self, address: u8) -> Option<BoxedDriver> {
        self.drivers.swap_remove(&address)
    }

    pub fn get(&self, address: u8) -> Option<&(dyn Driver + Send)> {
        self.drivers.get(&address).map(|driver| &**driver)
    }

    pub fn get_mut(&mut self, address: u8) -> Option<&mut BoxedDriver> {
        self.drivers.get_mut(&address)
    }

    pub fn contains(&self, address: u8) -> bool {
        self.drivers.contains_key(&address)
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.drivers.len() >= MAX_DRIVERS
    }

    /// Registered addresses in iteration order.
    pub fn addresses(&self) -> Vec<u8, MAX_DRIVERS> {
        self.drivers.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BoxedDriver> {
        self.drivers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut BoxedDriver> {
        self.drivers.values_mut()
    }

    /// Remove every driver, handing each back for release.
    pub fn drain(&mut self) -> Vec<BoxedDriver, MAX_DRIVERS> {
        let mut drained = Vec::new();
        for address in self.addresses() {
            if let Some(driver) = self.drivers.remove(&address) {
                let _ = drained.push(driver);
            }
        }
        drained
    }
}

impl core::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_map()
            .entries(self.drivers.iter().map(|(address, driver)| (address, driver.chip())))
            .finish()
    }
}

fn boxed<D: Driver + Send + 'static>(driver: D) -> BoxedDriver {
    Box::new(driver)
}

/// Chip name to constructor table.
#[derive(Debug, Clone)]
pub struct ChipCatalog {
    entries: Vec<(&'static str, DriverConstructor), MAX_CHIP_TYPES>,
}

impl ChipCatalog {
    pub fn empty() -> Self {
        Self { entries: Vec::new() }
    }

    /// Every driver shipped with the crate.
    pub fn builtin() -> Self {
        let mut catalog = Self::empty();
        catalog.register("aht20", |bus, address| Aht20::probe(bus, address).map(boxed));
        catalog.register("bme280", |bus, address| Bme280::probe(bus, address).map(boxed));
        catalog.register("dps310", |bus, address| Dps310::probe(bus, address).map(boxed));
        catalog.register("mcp9808", |bus, address| Mcp9808::probe(bus, address).map(boxed));
        catalog.register("scd30", |bus, address| Scd30::probe(bus, address).map(boxed));
        catalog.register("scd40", |bus, address| {
            Scd4x::probe(bus, address, Variant::Scd40).map(boxed)
        });
        catalog.register("scd41", |bus, address| {
            Scd4x::probe(bus, address, Variant::Scd41).map(boxed)
        });
        catalog
    }

    /// Add or replace a chip. Returns false if the catalog is full.
    pub fn register(&mut self, name: &'static str, constructor: DriverConstructor) -> bool {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        {
            entry.1 = constructor;
            return true;
        }
        self.entries.push((name, constructor)).is_ok()
    }

    pub fn lookup(&self, name: &str) -> Option<DriverConstructor> {
        self.entries
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, constructor)| *constructor)
    }

    pub fn chip_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|(name, _)| *name)
    }
}

impl Default for ChipCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
