//! Control-plane requests and responses, the outbound device event, and the
//! bounded JSON codec for all of them.

use crate::bus::{BusConfig, BusStatus};
use crate::drivers::Capability;
use crate::manager::ScanAddresses;
use alloc::string::String;
use arrayvec::ArrayString;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_REQUEST_SIZE: usize = 512;
pub const MAX_RESPONSE_SIZE: usize = 1024;
pub const MAX_EVENT_SIZE: usize = 512;
pub const MAX_PERIODS_PER_REQUEST: usize = 8;

pub type RequestBuffer = ArrayString<MAX_REQUEST_SIZE>;
pub type ResponseBuffer = ArrayString<MAX_RESPONSE_SIZE>;
pub type EventBuffer = ArrayString<MAX_EVENT_SIZE>;

/// Capability tag as it arrives on the wire. Tags this firmware does not
/// know still parse so they can be reported per item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SensorType {
    Known(Capability),
    Unrecognized(String),
}

impl From<Capability> for SensorType {
    fn from(capability: Capability) -> Self {
        SensorType::Known(capability)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityPeriod {
    pub sensor_type: SensorType,
    /// Zero disables sampling.
    pub period_ms: u64,
}

impl CapabilityPeriod {
    pub fn new(sensor_type: impl Into<SensorType>, period_ms: u64) -> Self {
        Self {
            sensor_type: sensor_type.into(),
            period_ms,
        }
    }
}

pub type PeriodList = Vec<CapabilityPeriod, MAX_PERIODS_PER_REQUEST>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInitRequest {
    pub address: u8,
    pub chip_name: String,
    #[serde(default)]
    pub capability_periods: PeriodList,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceUpdateRequest {
    pub address: u8,
    #[serde(default)]
    pub capability_periods: PeriodList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDeinitRequest {
    pub address: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    BusInit(BusConfig),
    BusScan,
    DeviceInit(DeviceInitRequest),
    DeviceUpdate(DeviceUpdateRequest),
    DeviceDeinit(DeviceDeinitRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    BusInit {
        is_initialized: bool,
        status: BusStatus,
    },
    BusScan {
        status: BusStatus,
        addresses_found: ScanAddresses,
    },
    DeviceInit {
        address: u8,
        is_success: bool,
        status: BusStatus,
    },
    DeviceUpdate {
        address: u8,
        status: BusStatus,
    },
    DeviceDeinit {
        address: u8,
        status: BusStatus,
    },
    /// The request never reached the bus manager.
    Rejected {
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub capability: Capability,
    pub value: f32,
}

pub type Readings = Vec<SensorReading, { Capability::COUNT }>;

/// Outbound message carrying one device's readings from one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEvent {
    pub device_address: u8,
    pub readings: Readings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid JSON format")]
    InvalidJson,
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },
    #[error("serialization failed")]
    SerializationError,
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
}

/// Serialize `value` into a fixed buffer, refusing anything longer than
/// `limit` bytes.
pub fn encode_into<T: Serialize, const N: usize>(
    value: &T,
    buffer: &mut ArrayString<N>,
    limit: usize,
) -> Result<usize, ProtocolError> {
    buffer.clear();
    let json = serde_json::to_string(value).map_err(|_| ProtocolError::SerializationError)?;
    let limit = limit.min(N);
    if json.len() > limit {
        return Err(ProtocolError::MessageTooLarge {
            size: json.len(),
            limit,
        });
    }
    buffer.push_str(&json);
    Ok(json.len())
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProtocolStats {
    pub requests_parsed: u32,
    pub requests_rejected: u32,
    pub responses_serialized: u32,
    pub oversize_responses: u32,
}

/// Request/response codec with preallocated buffers.
#[derive(Debug)]
pub struct ProtocolHandler {
    request_buffer: RequestBuffer,
    response_buffer: ResponseBuffer,
    stats: ProtocolStats,
}

impl ProtocolHandler {
    pub fn new() -> Self {
        Self {
            request_buffer: ArrayString::new(),
            response_buffer: ArrayString::new(),
            stats: ProtocolStats::default(),
        }
    }

    pub fn parse_request(&mut self, json: &str) -> Result<Request, ProtocolError> {
        let result = self.decode(json);
        match result {
            Ok(_) => self.stats.requests_parsed += 1,
            Err(_) => self.stats.requests_rejected += 1,
        }
        result
    }

    fn decode(&mut self, json: &str) -> Result<Request, ProtocolError> {
        self.request_buffer.clear();
        let json = json.trim();
        if json.len() > MAX_REQUEST_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: json.len(),
                limit: MAX_REQUEST_SIZE,
            });
        }
        self.request_buffer.push_str(json);

        let request =
            serde_json::from_str::<Request>(&self.request_buffer).map_err(|_| ProtocolError::InvalidJson)?;
        validate_request(&request)?;
        Ok(request)
    }

    pub fn serialize_response(&mut self, response: &Response) -> Result<&str, ProtocolError> {
        match encode_into(response, &mut self.response_buffer, MAX_RESPONSE_SIZE) {
            Ok(_) => {
                self.stats.responses_serialized += 1;
                Ok(&self.response_buffer)
            }
            Err(e) => {
                if matches!(e, ProtocolError::MessageTooLarge { .. }) {
                    self.stats.oversize_responses += 1;
                }
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> &ProtocolStats {
        &self.stats
    }
}

impl Default for ProtocolHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Shape checks that do not need the bus.
pub fn validate_request(request: &Request) -> Result<(), ProtocolError> {
    match request {
        Request::BusInit(config) if config.frequency_hz == 0 => {
            Err(ProtocolError::InvalidParameter("frequency_hz must be nonzero"))
        }
        Request::BusInit(config) if config.sda_pin == config.scl_pin => {
            Err(ProtocolError::InvalidParameter("sda_pin and scl_pin must differ"))
        }
        Request::DeviceInit(init) if init.chip_name.trim().is_empty() => {
            Err(ProtocolError::InvalidParameter("chip_name is empty"))
        }
        _ => Ok(()),
    }
}
