//! Request routing between the control plane, the bus manager and the
//! sampling loop.

use crate::bus::BusHandle;
use crate::config::BridgeConfig;
use crate::manager::BusManager;
use crate::protocol::{ProtocolError, ProtocolHandler, ProtocolStats, Request, Response};
use crate::publisher::{EventPublisher, PublishSink, PublishStats};
use crate::scheduler::{SamplingScheduler, SchedulerStats, TickReport};
use alloc::string::{String, ToString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeState {
    pub requests_handled: u32,
    pub requests_rejected: u32,
    pub ticks: u64,
    pub last_error: Option<String>,
}

/// Owns the whole sensor pipeline for one bus.
pub struct SensorBridge<B: BusHandle, S: PublishSink> {
    manager: BusManager<B>,
    scheduler: SamplingScheduler,
    publisher: EventPublisher,
    sink: S,
    protocol: ProtocolHandler,
    state: BridgeState,
}

impl<B: BusHandle, S: PublishSink> SensorBridge<B, S> {
    pub fn new(bus: B, sink: S) -> Self {
        Self {
            manager: BusManager::new(bus),
            scheduler: SamplingScheduler::new(),
            publisher: EventPublisher::default(),
            sink,
            protocol: ProtocolHandler::new(),
            state: BridgeState::default(),
        }
    }

    /// Build from config, bringing the bus and listed devices up. Startup
    /// failures are logged and left for the control plane to retry.
    pub fn with_config(bus: B, sink: S, config: &BridgeConfig) -> Self {
        let mut bridge = Self::new(bus, sink);
        bridge.publisher =
            EventPublisher::new(config.event_topic.clone()).with_max_payload(config.max_payload_bytes);

        let Some(bus_config) = config.bus else {
            return bridge;
        };
        let state = bridge.manager.initialize(bus_config);
        if !state.initialized {
            warn!(status = ?state.status, "bus failed to initialize at startup");
            return bridge;
        }
        for device in &config.devices {
            if !bridge.manager.init_device(device) {
                warn!(
                    address = device.address,
                    chip = %device.chip_name,
                    status = ?bridge.manager.status(),
                    "startup device init failed"
                );
            }
        }
        info!(devices = bridge.manager.registry().len(), "bridge configured");
        bridge
    }

    pub fn handle_request(&mut self, request: &Request) -> Response {
        self.state.requests_handled = self.state.requests_handled.saturating_add(1);
        match request {
            Request::BusInit(config) => {
                let state = self.manager.initialize(*config);
                Response::BusInit {
                    is_initialized: state.initialized,
                    status: state.status,
                }
            }
            Request::BusScan => {
                let scan = self.manager.scan();
                Response::BusScan {
                    status: scan.status,
                    addresses_found: scan.addresses,
                }
            }
            Request::DeviceInit(init) => {
                let is_success = self.manager.init_device(init);
                Response::DeviceInit {
                    address: init.address,
                    is_success,
                    status: self.manager.status(),
                }
            }
            Request::DeviceUpdate(update) => Response::DeviceUpdate {
                address: update.address,
                status: self.manager.update_device(update),
            },
            Request::DeviceDeinit(deinit) => Response::DeviceDeinit {
                address: deinit.address,
                status: self.manager.deinit_device(deinit),
            },
        }
    }

    /// Decode, route and encode one control-plane message. Undecodable
    /// input gets a `Rejected` response rather than an error.
    pub fn handle_json(&mut self, json: &str) -> Result<String, BridgeError> {
        let response = match self.protocol.parse_request(json) {
            Ok(request) => {
                info!(?request, "request received");
                self.handle_request(&request)
            }
            Err(e) => {
                warn!(error = %e, "rejecting request");
                self.state.requests_rejected = self.state.requests_rejected.saturating_add(1);
                self.state.last_error = Some(e.to_string());
                Response::Rejected { reason: e.to_string() }
            }
        };
        let encoded = self.protocol.serialize_response(&response).map_err(|e| {
            self.state.last_error = Some(e.to_string());
            e
        });
        Ok(encoded?.to_string())
    }

    /// Run one sampling pass at `now` milliseconds.
    pub fn update(&mut self, now: u64) -> TickReport {
        self.state.ticks += 1;
        self.scheduler
            .tick(now, &mut self.manager, &mut self.publisher, &mut self.sink)
    }

    /// Release every driver and close the bus.
    pub fn shutdown(&mut self) {
        self.manager.teardown();
    }

    pub fn manager(&self) -> &BusManager<B> {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut BusManager<B> {
        &mut self.manager
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn state(&self) -> &BridgeState {
        &self.state
    }

    pub fn scheduler_stats(&self) -> &SchedulerStats {
        self.scheduler.stats()
    }

    pub fn publish_stats(&self) -> &PublishStats {
        self.publisher.stats()
    }

    pub fn protocol_stats(&self) -> &ProtocolStats {
        self.protocol.stats()
    }
}
