//! # Sensor Bus
//!
//! Firmware-style management of a shared two-wire (I2C) sensor bus: bus
//! bring-up with electrical fault detection, address discovery, a driver
//! registry keyed by bus address, per-capability sampling and batched event
//! publishing.
//!
//! ## Features
//!
//! - **Fault-aware bus bring-up**: pull-up check before the transport opens,
//!   hung and shorted bus detection during scans
//! - **Polymorphic drivers**: AHT20, BME280, DPS310, MCP9808, SCD30 and
//!   SCD4x, each with its real register protocol
//! - **Independent sampling cadences**: every capability of every device has
//!   its own period
//! - **Bounded memory**: fixed-capacity registry, batches and message buffers
//!
//! ## Quick Start
//!
//! ```rust
//! use sensorbus::{BusConfig, BusManager, EventPublisher, MemorySink, SamplingScheduler};
//! use sensorbus::protocol::{CapabilityPeriod, DeviceInitRequest};
//! use sensorbus::drivers::Capability;
//! use sensorbus::sim::SimulatedBus;
//!
//! let mut manager = BusManager::new(SimulatedBus::with_default_chips());
//! assert!(manager.initialize(BusConfig::new(0, 4, 5)).initialized);
//!
//! let mut request = DeviceInitRequest {
//!     address: 0x18,
//!     chip_name: "mcp9808".into(),
//!     capability_periods: Default::default(),
//! };
//! request
//!     .capability_periods
//!     .push(CapabilityPeriod::new(Capability::AmbientTemperature, 1000))
//!     .unwrap();
//! assert!(manager.init_device(&request));
//!
//! let mut scheduler = SamplingScheduler::new();
//! let mut publisher = EventPublisher::default();
//! let mut sink = MemorySink::new();
//! let report = scheduler.tick(1001, &mut manager, &mut publisher, &mut sink);
//! assert_eq!(report.batches_published, 1);
//! ```
//!
//! ## Architecture
//!
//! - [`bus`] - transport trait, bus configuration and status
//! - [`drivers`] - driver trait, capability model and chip drivers
//! - [`registry`] - live drivers by address and the chip catalog
//! - [`manager`] - bus bring-up, scanning and device lifecycle
//! - [`scheduler`] - per-tick sampling and batching
//! - [`publisher`] - event encoding and the publish sink
//! - [`protocol`] - control-plane messages and codec
//! - [`bridge`] - request routing for the host binary
//! - [`sim`] - simulated bus and chip models

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::new_without_default)]

extern crate alloc;

pub mod bridge;
pub mod bus;
pub mod config;
pub mod drivers;
pub mod manager;
pub mod protocol;
pub mod publisher;
pub mod registry;
pub mod scheduler;
pub mod sim;

pub use bridge::SensorBridge;
pub use bus::{BusConfig, BusHandle, BusState, BusStatus, TransferError};
pub use config::BridgeConfig;
pub use drivers::{Capability, Driver, DriverError};
pub use manager::{BusManager, ScanResult};
pub use protocol::{DeviceEvent, Request, Response};
pub use publisher::{Delivery, EventPublisher, MemorySink, PublishSink};
pub use registry::{ChipCatalog, DriverRegistry};
pub use scheduler::{EventBatch, SamplingScheduler, TickReport};
