use sensorbus::protocol::*;
use sensorbus::*;

#[test]
fn test_bus_init_request_wire_format() {
    let mut handler = ProtocolHandler::new();

    let request = handler
        .parse_request(r#"{"BusInit":{"port":0,"sda_pin":21,"scl_pin":22,"frequency_hz":400000}}"#)
        .unwrap();

    assert_eq!(request, Request::BusInit(BusConfig::new(0, 21, 22).with_frequency(400_000)));
}

#[test]
fn test_frequency_defaults_when_omitted() {
    let mut handler = ProtocolHandler::new();

    let request = handler
        .parse_request(r#"{"BusInit":{"port":1,"sda_pin":4,"scl_pin":5}}"#)
        .unwrap();

    assert_eq!(request, Request::BusInit(BusConfig::new(1, 4, 5)));
}

#[test]
fn test_device_init_request_with_periods() {
    let mut handler = ProtocolHandler::new();
    let json = r#"{"DeviceInit":{"address":98,"chip_name":"scd41","capability_periods":[
        {"sensor_type":"CO2","period_ms":5000},
        {"sensor_type":"RelativeHumidity","period_ms":0}
    ]}}"#;

    let Request::DeviceInit(init) = handler.parse_request(json).unwrap() else {
        panic!("wrong variant");
    };

    assert_eq!(init.address, 0x62);
    assert_eq!(init.chip_name, "scd41");
    assert_eq!(
        init.capability_periods.as_slice(),
        &[
            CapabilityPeriod::new(Capability::CO2, 5000),
            CapabilityPeriod::new(Capability::RelativeHumidity, 0),
        ]
    );
}

#[test]
fn test_device_init_periods_optional() {
    let mut handler = ProtocolHandler::new();

    let request = handler
        .parse_request(r#"{"DeviceInit":{"address":24,"chip_name":"mcp9808"}}"#)
        .unwrap();

    assert!(matches!(request, Request::DeviceInit(init) if init.capability_periods.is_empty()));
}

#[test]
fn test_too_many_periods_rejected() {
    let mut handler = ProtocolHandler::new();
    let periods: Vec<String> = (0..=MAX_PERIODS_PER_REQUEST)
        .map(|_| r#"{"sensor_type":"CO2","period_ms":1}"#.to_string())
        .collect();
    let json = format!(
        r#"{{"DeviceUpdate":{{"address":98,"capability_periods":[{}]}}}}"#,
        periods.join(",")
    );

    assert_eq!(handler.parse_request(&json), Err(ProtocolError::InvalidJson));
}

#[test]
fn test_deinit_and_scan_requests() {
    let mut handler = ProtocolHandler::new();

    assert_eq!(
        handler.parse_request(r#"{"DeviceDeinit":{"address":119}}"#).unwrap(),
        Request::DeviceDeinit(DeviceDeinitRequest { address: 0x77 })
    );
    assert_eq!(handler.parse_request("  \"BusScan\"\n").unwrap(), Request::BusScan);
}

#[test]
fn test_malformed_requests_rejected() {
    let mut handler = ProtocolHandler::new();

    for json in [
        "",
        "not json",
        r#"{"Reboot":{}}"#,
        r#"{"DeviceDeinit":{"address":300}}"#,
        r#"{"DeviceDeinit":{}}"#,
    ] {
        assert_eq!(handler.parse_request(json), Err(ProtocolError::InvalidJson), "accepted {json:?}");
    }
    assert_eq!(handler.stats().requests_rejected, 5);
    assert_eq!(handler.stats().requests_parsed, 0);
}

#[test]
fn test_invalid_parameters_rejected() {
    let mut handler = ProtocolHandler::new();

    assert!(matches!(
        handler.parse_request(r#"{"BusInit":{"port":0,"sda_pin":4,"scl_pin":4}}"#),
        Err(ProtocolError::InvalidParameter(_))
    ));
    assert!(matches!(
        handler.parse_request(r#"{"BusInit":{"port":0,"sda_pin":4,"scl_pin":5,"frequency_hz":0}}"#),
        Err(ProtocolError::InvalidParameter(_))
    ));
    assert!(matches!(
        handler.parse_request(r#"{"DeviceInit":{"address":24,"chip_name":"  "}}"#),
        Err(ProtocolError::InvalidParameter(_))
    ));
}

#[test]
fn test_responses_serialize_with_status_names() {
    let mut handler = ProtocolHandler::new();
    let mut addresses = manager::ScanAddresses::new();
    addresses.push(0x18).unwrap();
    addresses.push(0x77).unwrap();

    let json = handler
        .serialize_response(&Response::BusScan {
            status: BusStatus::ErrorHang,
            addresses_found: addresses,
        })
        .unwrap()
        .to_string();
    assert_eq!(json, r#"{"BusScan":{"status":"ErrorHang","addresses_found":[24,119]}}"#);

    let json = handler
        .serialize_response(&Response::DeviceInit {
            address: 0x38,
            is_success: false,
            status: BusStatus::DeviceAlreadyInitialized,
        })
        .unwrap()
        .to_string();
    assert_eq!(
        json,
        r#"{"DeviceInit":{"address":56,"is_success":false,"status":"DeviceAlreadyInitialized"}}"#
    );
    assert_eq!(handler.stats().responses_serialized, 2);
}

#[test]
fn test_full_scan_response_fits_buffer() {
    let mut handler = ProtocolHandler::new();
    let addresses: manager::ScanAddresses = (bus::SCAN_FIRST_ADDRESS..=bus::SCAN_LAST_ADDRESS).collect();

    let response = Response::BusScan {
        status: BusStatus::Success,
        addresses_found: addresses,
    };

    assert!(handler.serialize_response(&response).is_ok());
}

#[test]
fn test_device_event_wire_format() {
    let mut readings = Readings::new();
    readings
        .push(SensorReading {
            capability: Capability::AmbientTemperature,
            value: 21.5,
        })
        .unwrap();
    readings
        .push(SensorReading {
            capability: Capability::CO2,
            value: 640.0,
        })
        .unwrap();
    let event = DeviceEvent {
        device_address: 0x62,
        readings,
    };

    let json = serde_json::to_string(&event).unwrap();

    assert_eq!(
        json,
        r#"{"device_address":98,"readings":[{"capability":"AmbientTemperature","value":21.5},{"capability":"CO2","value":640.0}]}"#
    );
    assert_eq!(serde_json::from_str::<DeviceEvent>(&json).unwrap(), event);
}

#[test]
fn test_largest_event_fits_default_limit() {
    let mut readings = Readings::new();
    for capability in Capability::ALL {
        readings
            .push(SensorReading {
                capability,
                value: -123_456.79,
            })
            .unwrap();
    }
    let event = DeviceEvent {
        device_address: 0x7F,
        readings,
    };
    let mut buffer = EventBuffer::new();

    let size = encode_into(&event, &mut buffer, MAX_EVENT_SIZE).unwrap();

    assert!(size < MAX_EVENT_SIZE);
    assert_eq!(buffer.len(), size);

    // A single reading always fits the smallest configurable limit
    let mut single = event.clone();
    single.readings.truncate(1);
    assert!(encode_into(&single, &mut buffer, config::MIN_PAYLOAD_BYTES).is_ok());
}
