//! Per-tick sampling of due capabilities and batching into device events.

use crate::bus::BusHandle;
use crate::drivers::{Capability, Driver};
use crate::manager::BusManager;
use crate::protocol::{Readings, SensorReading};
use crate::publisher::{EventPublisher, PublishSink};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

/// Readings one driver produced during one tick, in capability order.
#[derive(Debug, Clone, PartialEq)]
pub struct EventBatch {
    pub device_address: u8,
    pub readings: Readings,
}

impl EventBatch {
    pub fn new(device_address: u8) -> Self {
        Self {
            device_address,
            readings: Readings::new(),
        }
    }

    /// Append a reading; a capability already in the batch is refused.
    pub fn push(&mut self, capability: Capability, value: f32) -> bool {
        if self.get(capability).is_some() {
            return false;
        }
        self.readings.push(SensorReading { capability, value }).is_ok()
    }

    pub fn get(&self, capability: Capability) -> Option<f32> {
        self.readings
            .iter()
            .find(|reading| reading.capability == capability)
            .map(|reading| reading.value)
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub drivers_evaluated: u16,
    pub samples_taken: u16,
    pub samples_failed: u16,
    pub batches_published: u16,
    pub batches_dropped: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub skipped_ticks: u64,
    pub samples_taken: u64,
    pub samples_failed: u64,
    pub batches_published: u64,
    pub batches_dropped: u64,
    pub last_tick_time: u64,
}

/// Drives per-capability sampling for every registered driver.
#[derive(Debug, Default)]
pub struct SamplingScheduler {
    stats: SchedulerStats,
}

impl SamplingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// One pass over the registry. Does nothing unless the bus is up.
    ///
    /// Failed reads keep their previous timestamp so they are retried on the
    /// next tick.
    pub fn tick<B, S>(
        &mut self,
        now: u64,
        manager: &mut BusManager<B>,
        publisher: &mut EventPublisher,
        sink: &mut S,
    ) -> TickReport
    where
        B: BusHandle,
        S: PublishSink + ?Sized,
    {
        let mut report = TickReport::default();
        if !manager.is_initialized() {
            self.stats.skipped_ticks += 1;
            return report;
        }

        let (bus, registry) = manager.parts_mut();
        for driver in registry.iter_mut() {
            report.drivers_evaluated += 1;
            let batch = collect(now, &mut *bus, driver.as_mut(), &mut report);
            if batch.is_empty() {
                continue;
            }
            if publisher.publish(&batch, sink) {
                report.batches_published += 1;
            } else {
                report.batches_dropped += 1;
            }
        }

        self.record(now, &report);
        trace!(now, ?report, "tick complete");
        report
    }

    fn record(&mut self, now: u64, report: &TickReport) {
        self.stats.ticks += 1;
        self.stats.samples_taken += u64::from(report.samples_taken);
        self.stats.samples_failed += u64::from(report.samples_failed);
        self.stats.batches_published += u64::from(report.batches_published);
        self.stats.batches_dropped += u64::from(report.batches_dropped);
        self.stats.last_tick_time = now;
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }
}

fn collect(now: u64, bus: &mut dyn BusHandle, driver: &mut dyn Driver, report: &mut TickReport) -> EventBatch {
    let address = driver.address();
    let mut batch = EventBatch::new(address);

    for capability in driver.capabilities() {
        if !driver.is_due(capability, now) {
            continue;
        }
        match driver.sample(bus, capability) {
            Ok(value) if value.is_finite() => {
                debug!(address, %capability, value, unit = capability.unit(), "sampled");
                batch.push(capability, value);
                driver.set_last_sample_time(capability, now);
                report.samples_taken += 1;
            }
            Ok(value) => {
                warn!(address, %capability, value, "discarding non-finite reading");
                report.samples_failed += 1;
            }
            Err(e) => {
                warn!(address, chip = driver.chip(), %capability, error = %e, "sample failed, retrying next tick");
                report.samples_failed += 1;
            }
        }
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_refuses_duplicate_capability() {
        let mut batch = EventBatch::new(0x18);
        assert!(batch.push(Capability::AmbientTemperature, 20.0));
        assert!(!batch.push(Capability::AmbientTemperature, 21.0));
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.get(Capability::AmbientTemperature), Some(20.0));
        assert_eq!(batch.get(Capability::CO2), None);
    }

    #[test]
    fn test_batch_holds_every_capability() {
        let mut batch = EventBatch::new(0x77);
        for (i, capability) in Capability::ALL.iter().enumerate() {
            assert!(batch.push(*capability, i as f32));
        }
        assert_eq!(batch.len(), Capability::COUNT);
    }
}
