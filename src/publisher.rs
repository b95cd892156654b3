//! Outbound event serialization and hand-off to the network session.

use crate::protocol::{encode_into, DeviceEvent, EventBuffer, ProtocolError, MAX_EVENT_SIZE};
use crate::scheduler::EventBatch;
use alloc::string::String;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_EVENT_TOPIC: &str = "sensorbus/events";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delivery {
    AtMostOnce,
    AtLeastOnce,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("session not connected")]
    NotConnected,
    #[error("outbound queue full")]
    QueueFull,
    #[error("sink rejected message: {0}")]
    Rejected(String),
}

/// Network session that takes encoded messages for delivery.
pub trait PublishSink {
    fn publish(&mut self, topic: &str, payload: &[u8], delivery: Delivery) -> Result<(), SinkError>;
}

impl<T: PublishSink + ?Sized> PublishSink for &mut T {
    fn publish(&mut self, topic: &str, payload: &[u8], delivery: Delivery) -> Result<(), SinkError> {
        (**self).publish(topic, payload, delivery)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PublishStats {
    pub published: u32,
    pub dropped_oversize: u32,
    pub dropped_sink: u32,
    pub bytes_published: u64,
}

#[derive(Debug)]
pub struct EventPublisher {
    topic: String,
    max_payload_bytes: usize,
    buffer: EventBuffer,
    stats: PublishStats,
}

impl EventPublisher {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            max_payload_bytes: MAX_EVENT_SIZE,
            buffer: EventBuffer::new(),
            stats: PublishStats::default(),
        }
    }

    /// Lower the payload limit below the buffer size. Values above the
    /// buffer size are capped.
    #[must_use]
    pub fn with_max_payload(mut self, max_payload_bytes: usize) -> Self {
        self.max_payload_bytes = max_payload_bytes.min(MAX_EVENT_SIZE);
        self
    }

    /// Encode `batch` and hand it to `sink`. Nothing is retried.
    pub fn publish<S: PublishSink + ?Sized>(&mut self, batch: &EventBatch, sink: &mut S) -> bool {
        let event = DeviceEvent {
            device_address: batch.device_address,
            readings: batch.readings.clone(),
        };

        match encode_into(&event, &mut self.buffer, self.max_payload_bytes) {
            Ok(_) => {}
            Err(ProtocolError::MessageTooLarge { size, limit }) => {
                warn!(address = batch.device_address, size, limit, "event exceeds payload limit, dropped");
                self.stats.dropped_oversize += 1;
                return false;
            }
            Err(e) => {
                warn!(address = batch.device_address, error = %e, "failed to encode event");
                self.stats.dropped_oversize += 1;
                return false;
            }
        }

        if let Err(e) = sink.publish(&self.topic, self.buffer.as_bytes(), Delivery::AtLeastOnce) {
            warn!(address = batch.device_address, error = %e, "sink rejected event");
            self.stats.dropped_sink += 1;
            return false;
        }

        debug!(address = batch.device_address, bytes = self.buffer.len(), topic = %self.topic, "event published");
        self.stats.published += 1;
        self.stats.bytes_published += self.buffer.len() as u64;
        true
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes
    }

    pub fn stats(&self) -> &PublishStats {
        &self.stats
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_TOPIC)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub delivery: Delivery,
}

impl PublishedMessage {
    pub fn decode(&self) -> Result<DeviceEvent, ProtocolError> {
        serde_json::from_slice(&self.payload).map_err(|_| ProtocolError::InvalidJson)
    }
}

/// Sink that keeps everything it is given; optionally refuses while
/// "disconnected".
#[derive(Debug)]
pub struct MemorySink {
    messages: Vec<PublishedMessage>,
    connected: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            connected: true,
        }
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    pub fn messages(&self) -> &[PublishedMessage] {
        &self.messages
    }

    pub fn take(&mut self) -> Vec<PublishedMessage> {
        core::mem::take(&mut self.messages)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl PublishSink for MemorySink {
    fn publish(&mut self, topic: &str, payload: &[u8], delivery: Delivery) -> Result<(), SinkError> {
        if !self.connected {
            return Err(SinkError::NotConnected);
        }
        self.messages.push(PublishedMessage {
            topic: topic.into(),
            payload: payload.to_vec(),
            delivery,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::Capability;
    use crate::protocol::SensorReading;

    fn batch() -> EventBatch {
        let mut batch = EventBatch::new(0x44);
        batch.push(Capability::AmbientTemperature, 21.5);
        batch.push(Capability::RelativeHumidity, 40.25);
        batch
    }

    #[test]
    fn test_publish_encodes_readings_in_order() {
        let mut publisher = EventPublisher::new("dev/events");
        let mut sink = MemorySink::new();
        assert!(publisher.publish(&batch(), &mut sink));

        let message = &sink.messages()[0];
        assert_eq!(message.topic, "dev/events");
        assert_eq!(message.delivery, Delivery::AtLeastOnce);
        let event = message.decode().unwrap();
        assert_eq!(event.device_address, 0x44);
        assert_eq!(
            event.readings.as_slice(),
            &[
                SensorReading {
                    capability: Capability::AmbientTemperature,
                    value: 21.5
                },
                SensorReading {
                    capability: Capability::RelativeHumidity,
                    value: 40.25
                },
            ]
        );
        assert_eq!(publisher.stats().bytes_published, message.payload.len() as u64);
    }

    #[test]
    fn test_oversize_event_is_dropped() {
        let mut publisher = EventPublisher::new("dev/events").with_max_payload(16);
        let mut sink = MemorySink::new();
        assert!(!publisher.publish(&batch(), &mut sink));
        assert!(sink.messages().is_empty());
        assert_eq!(publisher.stats().dropped_oversize, 1);
    }

    #[test]
    fn test_sink_rejection_counts_drop() {
        let mut publisher = EventPublisher::default();
        let mut sink = MemorySink::new();
        sink.set_connected(false);
        assert!(!publisher.publish(&batch(), &mut sink));
        assert_eq!(publisher.stats().dropped_sink, 1);
        assert_eq!(publisher.stats().published, 0);
    }

    #[test]
    fn test_payload_limit_capped_at_buffer() {
        let publisher = EventPublisher::default().with_max_payload(usize::MAX);
        assert_eq!(publisher.max_payload_bytes(), MAX_EVENT_SIZE);
    }
}
