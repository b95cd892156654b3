use sensorbus::bus::BusHandle;
use sensorbus::drivers::{crc8, scd30, DriverError, SamplingTable};
use sensorbus::protocol::*;
use sensorbus::publisher::PublishedMessage;
use sensorbus::registry::{BoxedDriver, ChipCatalog};
use sensorbus::sim::SimulatedBus;
use sensorbus::*;

struct Rig {
    manager: BusManager<SimulatedBus>,
    scheduler: SamplingScheduler,
    publisher: EventPublisher,
    sink: MemorySink,
}

impl Rig {
    fn new() -> Self {
        Self::with_manager(BusManager::new(SimulatedBus::with_default_chips()))
    }

    fn with_manager(mut manager: BusManager<SimulatedBus>) -> Self {
        assert!(manager.initialize(BusConfig::new(0, 4, 5)).initialized);
        Self {
            manager,
            scheduler: SamplingScheduler::new(),
            publisher: EventPublisher::default(),
            sink: MemorySink::new(),
        }
    }

    fn add(&mut self, address: u8, chip: &str, periods: &[(Capability, u64)]) {
        let mut capability_periods = PeriodList::new();
        for (capability, period_ms) in periods {
            capability_periods
                .push(CapabilityPeriod::new(*capability, *period_ms))
                .unwrap();
        }
        let request = DeviceInitRequest {
            address,
            chip_name: chip.to_string(),
            capability_periods,
        };
        assert!(self.manager.init_device(&request), "{chip} at 0x{address:02X} failed to init");
    }

    fn tick(&mut self, now: u64) -> TickReport {
        self.scheduler
            .tick(now, &mut self.manager, &mut self.publisher, &mut self.sink)
    }

    fn events(&mut self) -> Vec<DeviceEvent> {
        self.sink
            .take()
            .iter()
            .map(|message| message.decode().unwrap())
            .collect()
    }
}

fn capabilities(event: &DeviceEvent) -> Vec<Capability> {
    event.readings.iter().map(|reading| reading.capability).collect()
}

#[test]
fn test_sample_only_after_period_strictly_elapsed() {
    let mut rig = Rig::new();
    rig.add(0x18, "mcp9808", &[(Capability::AmbientTemperature, 5000)]);

    assert_eq!(rig.tick(4999).samples_taken, 0);
    assert_eq!(rig.tick(5000).samples_taken, 0);
    assert!(rig.events().is_empty());

    let report = rig.tick(5001);
    assert_eq!(report.samples_taken, 1);
    assert_eq!(report.batches_published, 1);
    assert_eq!(
        rig.manager.registry().get(0x18).unwrap().last_sample_time(Capability::AmbientTemperature),
        Some(5001)
    );

    // Next window starts at the last successful sample
    assert_eq!(rig.tick(10_001).samples_taken, 0);
    assert_eq!(rig.tick(10_002).samples_taken, 1);
}

#[test]
fn test_failed_sample_keeps_timestamp_and_retries_next_tick() {
    let mut rig = Rig::new();
    rig.add(0x18, "mcp9808", &[(Capability::AmbientTemperature, 1000)]);
    rig.manager.bus_mut().fail_next(0x18, TransferError::DataNack, 1);

    let report = rig.tick(1001);
    assert_eq!(report.samples_failed, 1);
    assert_eq!(report.samples_taken, 0);
    assert_eq!(report.batches_published, 0);
    assert!(rig.events().is_empty());
    assert_eq!(
        rig.manager.registry().get(0x18).unwrap().last_sample_time(Capability::AmbientTemperature),
        Some(0)
    );

    let report = rig.tick(1002);
    assert_eq!(report.samples_taken, 1);
    assert_eq!(rig.events().len(), 1);
    assert_eq!(rig.scheduler.stats().samples_failed, 1);
    assert_eq!(rig.scheduler.stats().samples_taken, 1);
}

#[test]
fn test_no_periods_means_no_events() {
    let mut rig = Rig::new();
    rig.add(0x77, "bme280", &[]);
    rig.add(0x62, "scd40", &[(Capability::CO2, 0)]);

    for now in (0..60_000).step_by(1000) {
        let report = rig.tick(now);
        assert_eq!(report.drivers_evaluated, 2);
        assert_eq!(report.samples_taken, 0);
    }
    assert!(rig.sink.messages().is_empty());
}

#[test]
fn test_due_capabilities_batched_in_fixed_order() {
    let mut rig = Rig::new();
    rig.add(
        0x77,
        "bme280",
        &[
            (Capability::Altitude, 1000),
            (Capability::Pressure, 1000),
            (Capability::RelativeHumidity, 1000),
            (Capability::AmbientTemperature, 1000),
        ],
    );

    rig.tick(1001);

    let events = rig.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].device_address, 0x77);
    assert_eq!(
        capabilities(&events[0]),
        vec![
            Capability::AmbientTemperature,
            Capability::RelativeHumidity,
            Capability::Pressure,
            Capability::Altitude,
        ]
    );
}

#[test]
fn test_independent_cadences_per_capability() {
    let mut rig = Rig::new();
    rig.add(
        0x38,
        "aht20",
        &[(Capability::AmbientTemperature, 1000), (Capability::RelativeHumidity, 3000)],
    );

    let mut temperature = 0;
    let mut humidity = 0;
    let mut now = 0;
    while now <= 12_000 {
        rig.tick(now);
        for event in rig.events() {
            for reading in event.readings.iter() {
                match reading.capability {
                    Capability::AmbientTemperature => temperature += 1,
                    Capability::RelativeHumidity => humidity += 1,
                    other => panic!("unexpected {other}"),
                }
            }
        }
        now += 500;
    }

    // Strictly-greater rule: temperature at 1500, 3000, ..., 12000 and humidity at 3500, 7000, 10500
    assert_eq!(temperature, 8);
    assert_eq!(humidity, 3);
}

#[test]
fn test_one_event_per_device_per_tick() {
    let mut rig = Rig::new();
    rig.add(0x18, "mcp9808", &[(Capability::AmbientTemperature, 1000)]);
    rig.add(0x76, "dps310", &[(Capability::Pressure, 1000), (Capability::AmbientTemperature, 1000)]);
    rig.add(0x62, "scd41", &[(Capability::CO2, 1000)]);

    let report = rig.tick(2000);

    assert_eq!(report.drivers_evaluated, 3);
    assert_eq!(report.samples_taken, 4);
    assert_eq!(report.batches_published, 3);
    let mut addresses: Vec<u8> = rig.events().iter().map(|event| event.device_address).collect();
    addresses.sort_unstable();
    assert_eq!(addresses, vec![0x18, 0x62, 0x76]);
}

#[test]
fn test_readings_published_unmodified() {
    let mut rig = Rig::new();
    rig.manager.bus_mut().environment_mut().co2_ppm = 812.0;
    rig.manager.bus_mut().environment_mut().temperature_c = 19.25;
    rig.add(0x61, "scd30", &[(Capability::CO2, 1000), (Capability::AmbientTemperature, 1000)]);

    rig.tick(1001);

    let events = rig.events();
    assert_eq!(events.len(), 1);
    let readings = &events[0].readings;
    assert_eq!(readings[0].capability, Capability::AmbientTemperature);
    assert_eq!(readings[0].value, 19.25);
    assert_eq!(readings[1].capability, Capability::CO2);
    assert_eq!(readings[1].value, 812.0);
}

#[test]
fn test_stopped_chip_fails_sample_until_measuring_again() {
    let mut rig = Rig::new();
    rig.manager.bus_mut().environment_mut().co2_ppm = 950.0;
    rig.add(0x61, "scd30", &[(Capability::CO2, 1000)]);
    rig.tick(1001);
    assert_eq!(rig.events()[0].readings[0].value, 950.0);

    // Chip drops out of continuous measurement behind the driver's back
    let stop = scd30::CMD_STOP_CONTINUOUS.to_be_bytes();
    rig.manager.bus_mut().write(0x61, &stop).unwrap();
    rig.manager.bus_mut().environment_mut().co2_ppm = 2000.0;

    let report = rig.tick(2002);
    assert_eq!(report.samples_failed, 1);
    assert_eq!(report.samples_taken, 0);
    assert_eq!(report.batches_published, 0);
    assert!(rig.events().is_empty());
    assert_eq!(
        rig.manager.registry().get(0x61).unwrap().last_sample_time(Capability::CO2),
        Some(1001)
    );

    let mut start = [0u8; 5];
    start[..2].copy_from_slice(&scd30::CMD_START_CONTINUOUS.to_be_bytes());
    start[4] = crc8(&[0, 0]);
    rig.manager.bus_mut().write(0x61, &start).unwrap();

    let report = rig.tick(2003);
    assert_eq!(report.samples_taken, 1);
    assert_eq!(rig.events()[0].readings[0].value, 2000.0);
}

#[test]
fn test_uninitialized_bus_skips_tick() {
    let mut manager = BusManager::new(SimulatedBus::with_default_chips());
    let mut scheduler = SamplingScheduler::new();
    let mut publisher = EventPublisher::default();
    let mut sink = MemorySink::new();

    let report = scheduler.tick(10_000, &mut manager, &mut publisher, &mut sink);

    assert_eq!(report, TickReport::default());
    assert_eq!(scheduler.stats().skipped_ticks, 1);
    assert_eq!(scheduler.stats().ticks, 0);
    assert_eq!(manager.bus().stats().transactions, 0);
}

#[test]
fn test_torn_down_bus_stops_sampling() {
    let mut rig = Rig::new();
    rig.add(0x18, "mcp9808", &[(Capability::AmbientTemperature, 1000)]);
    rig.manager.teardown();

    let report = rig.tick(5000);

    assert_eq!(report.samples_taken, 0);
    assert_eq!(rig.scheduler.stats().skipped_ticks, 1);
}

#[test]
fn test_deinit_stops_events_and_sleeps_chip() {
    let mut rig = Rig::new();
    rig.add(0x62, "scd40", &[(Capability::CO2, 1000)]);
    rig.tick(1001);
    assert_eq!(rig.events().len(), 1);

    rig.manager.deinit_device(&DeviceDeinitRequest { address: 0x62 });
    let report = rig.tick(5000);

    assert_eq!(report.drivers_evaluated, 0);
    assert!(rig.events().is_empty());
    assert!(rig.manager.bus().device(0x62).unwrap().is_sleeping());
}

#[test]
fn test_period_update_takes_effect_next_tick() {
    let mut rig = Rig::new();
    rig.add(0x18, "mcp9808", &[(Capability::AmbientTemperature, 60_000)]);
    assert_eq!(rig.tick(1001).samples_taken, 0);

    let mut capability_periods = PeriodList::new();
    capability_periods
        .push(CapabilityPeriod::new(Capability::AmbientTemperature, 1000))
        .unwrap();
    rig.manager.update_device(&DeviceUpdateRequest {
        address: 0x18,
        capability_periods,
    });

    assert_eq!(rig.tick(1002).samples_taken, 1);
}

#[test]
fn test_disconnected_sink_drops_batches() {
    let mut rig = Rig::new();
    rig.add(0x18, "mcp9808", &[(Capability::AmbientTemperature, 1000)]);
    rig.sink.set_connected(false);

    let report = rig.tick(1001);

    // The sample still counts; only delivery failed
    assert_eq!(report.samples_taken, 1);
    assert_eq!(report.batches_dropped, 1);
    assert_eq!(rig.scheduler.stats().batches_dropped, 1);
    assert_eq!(rig.publisher.stats().dropped_sink, 1);
    assert!(rig.sink.messages().is_empty());
}

#[test]
fn test_stats_accumulate_across_ticks() {
    let mut rig = Rig::new();
    rig.add(0x18, "mcp9808", &[(Capability::AmbientTemperature, 1000)]);

    for now in [1001, 2002, 3003] {
        rig.tick(now);
    }

    let stats = rig.scheduler.stats();
    assert_eq!(stats.ticks, 3);
    assert_eq!(stats.samples_taken, 3);
    assert_eq!(stats.batches_published, 3);
    assert_eq!(stats.last_tick_time, 3003);
}

/// Driver that always yields NaN, standing in for a chip returning garbage.
struct NanSensor {
    address: u8,
    sampling: SamplingTable,
}

impl Driver for NanSensor {
    fn chip(&self) -> &'static str {
        "nan-sensor"
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

    fn sample(&mut self, _bus: &mut dyn BusHandle, _capability: Capability) -> Result<f32, DriverError> {
        Ok(f32::NAN)
    }
}

fn nan_sensor(_bus: &mut dyn BusHandle, address: u8) -> Result<BoxedDriver, DriverError> {
    Ok(Box::new(NanSensor {
        address,
        sampling: SamplingTable::new(&[Capability::AmbientTemperature]),
    }))
}

#[test]
fn test_non_finite_reading_counts_as_failure() {
    let mut catalog = ChipCatalog::builtin();
    assert!(catalog.register("nan-sensor", nan_sensor));
    let mut rig = Rig::with_manager(BusManager::with_catalog(SimulatedBus::new(), catalog));
    rig.add(0x20, "nan-sensor", &[(Capability::AmbientTemperature, 1000)]);

    let report = rig.tick(1001);

    assert_eq!(report.samples_failed, 1);
    assert_eq!(report.batches_published, 0);
    assert!(rig.sink.messages().is_empty());
    assert_eq!(
        rig.manager.registry().get(0x20).unwrap().last_sample_time(Capability::AmbientTemperature),
        Some(0)
    );
}

#[test]
fn test_published_message_carries_topic_and_delivery() {
    let mut rig = Rig::new();
    rig.publisher = EventPublisher::new("lab/bench");
    rig.add(0x18, "mcp9808", &[(Capability::AmbientTemperature, 1000)]);

    rig.tick(1001);

    let messages: Vec<PublishedMessage> = rig.sink.take();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].topic, "lab/bench");
    assert_eq!(messages[0].delivery, Delivery::AtLeastOnce);
}
