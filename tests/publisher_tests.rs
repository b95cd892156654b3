use sensorbus::config::MIN_PAYLOAD_BYTES;
use sensorbus::publisher::*;
use sensorbus::*;

/// Outbound queue that holds a fixed number of messages.
struct BoundedQueue {
    capacity: usize,
    queued: Vec<(String, Vec<u8>)>,
}

impl PublishSink for BoundedQueue {
    fn publish(&mut self, topic: &str, payload: &[u8], _delivery: Delivery) -> Result<(), SinkError> {
        if self.queued.len() >= self.capacity {
            return Err(SinkError::QueueFull);
        }
        self.queued.push((topic.to_string(), payload.to_vec()));
        Ok(())
    }
}

fn full_batch(address: u8) -> EventBatch {
    let mut batch = EventBatch::new(address);
    for (i, capability) in Capability::ALL.into_iter().enumerate() {
        assert!(batch.push(capability, 1000.0 + i as f32));
    }
    batch
}

#[test]
fn test_batch_refuses_repeated_capability() {
    let mut batch = EventBatch::new(0x38);

    assert!(batch.push(Capability::RelativeHumidity, 40.0));
    assert!(!batch.push(Capability::RelativeHumidity, 41.0));

    assert_eq!(batch.len(), 1);
    assert_eq!(batch.get(Capability::RelativeHumidity), Some(40.0));
    assert_eq!(batch.get(Capability::CO2), None);
}

#[test]
fn test_queue_full_drops_without_retry() {
    let mut publisher = EventPublisher::new("plant/floor");
    let mut queue = BoundedQueue {
        capacity: 2,
        queued: Vec::new(),
    };

    let results: Vec<bool> = (0..4u8)
        .map(|i| publisher.publish(&full_batch(0x10 + i), &mut queue))
        .collect();

    assert_eq!(results, vec![true, true, false, false]);
    assert_eq!(queue.queued.len(), 2);
    assert!(queue.queued.iter().all(|(topic, _)| topic == "plant/floor"));
    assert_eq!(publisher.stats().published, 2);
    assert_eq!(publisher.stats().dropped_sink, 2);
}

#[test]
fn test_smallest_limit_drops_full_batch_but_not_single_reading() {
    let mut publisher = EventPublisher::default().with_max_payload(MIN_PAYLOAD_BYTES);
    let mut sink = MemorySink::new();
    let mut single = EventBatch::new(0x44);
    single.push(Capability::AmbientTemperature, 21.5);

    assert!(!publisher.publish(&full_batch(0x77), &mut sink));
    assert!(publisher.publish(&single, &mut sink));

    assert_eq!(publisher.stats().dropped_oversize, 1);
    assert_eq!(sink.messages().len(), 1);
    assert!(sink.messages()[0].payload.len() <= MIN_PAYLOAD_BYTES);
}

#[test]
fn test_publish_through_borrowed_sink() {
    let mut publisher = EventPublisher::default();
    let mut sink = MemorySink::new();
    let mut borrowed = &mut sink;

    assert!(publisher.publish(&full_batch(0x62), &mut borrowed));

    assert_eq!(sink.messages()[0].topic, DEFAULT_EVENT_TOPIC);
}

#[test]
fn test_take_drains_sink_and_reconnect_resumes() {
    let mut publisher = EventPublisher::default();
    let mut sink = MemorySink::new();
    publisher.publish(&full_batch(0x18), &mut sink);

    let taken = sink.take();
    assert_eq!(taken.len(), 1);
    assert!(sink.messages().is_empty());

    sink.set_connected(false);
    assert!(!publisher.publish(&full_batch(0x18), &mut sink));
    sink.set_connected(true);
    assert!(publisher.publish(&full_batch(0x18), &mut sink));

    let event = sink.messages()[0].decode().unwrap();
    assert_eq!(event.readings.len(), Capability::COUNT);
    assert_eq!(event.readings[0].capability, Capability::AmbientTemperature);
    assert_eq!(event.readings[4].capability, Capability::Altitude);
}
