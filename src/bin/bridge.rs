use clap::{App, Arg};
use sensorbus::config::{BridgeConfig, DEFAULT_LISTEN_PORT};
use sensorbus::publisher::{Delivery, PublishSink, SinkError};
use sensorbus::sim::SimulatedBus;
use sensorbus::SensorBridge;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::time;
use tracing::{debug, error, info, trace, warn};

const EVENT_BROADCAST_BUFFER_SIZE: usize = 256;

/// Fans published events out to every connected control-plane client.
struct BroadcastSink {
    tx: broadcast::Sender<String>,
}

impl PublishSink for BroadcastSink {
    fn publish(&mut self, topic: &str, payload: &[u8], _delivery: Delivery) -> Result<(), SinkError> {
        let text = std::str::from_utf8(payload).map_err(|e| SinkError::Rejected(e.to_string()))?;
        // No subscribers is not a delivery failure; the event is simply unobserved
        if self.tx.send(text.to_string()).is_err() {
            trace!(topic, "no clients connected, event not forwarded");
        }
        Ok(())
    }
}

type SharedBridge = Arc<Mutex<SensorBridge<SimulatedBus, BroadcastSink>>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("sensorbus-bridge")
        .version("0.1.0")
        .author("Sensor Systems Engineering Team")
        .about("Sensor bus bridge: simulated two-wire bus, sampling loop and TCP control plane")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON bridge configuration")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Control plane TCP port")
                .takes_value(true)
                .validator(|v| v.parse::<u16>().map(|_| ()).map_err(|_| "port must be a number".into())),
        )
        .arg(
            Arg::with_name("tick-ms")
                .short("t")
                .long("tick-ms")
                .value_name("MS")
                .help("Sampling tick interval in milliseconds")
                .takes_value(true)
                .validator(|v| match v.parse::<u64>() {
                    Ok(ms) if ms > 0 => Ok(()),
                    _ => Err("tick interval must be a positive number".into()),
                }),
        )
        .arg(
            Arg::with_name("topic")
                .long("topic")
                .value_name("TOPIC")
                .help("Event topic")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("empty-bus")
                .long("empty-bus")
                .help("Start with no simulated chips attached"),
        )
        .get_matches();

    let mut config = match matches.value_of("config") {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::default(),
    };
    if let Some(port) = matches.value_of("port") {
        config.listen_port = port.parse()?;
    }
    if let Some(tick_ms) = matches.value_of("tick-ms") {
        config.tick_interval_ms = tick_ms.parse()?;
    }
    if let Some(topic) = matches.value_of("topic") {
        config.event_topic = topic.to_string();
    }
    config.validate()?;

    let bus = if matches.is_present("empty-bus") {
        SimulatedBus::new()
    } else {
        SimulatedBus::with_default_chips()
    };

    let (event_tx, _) = broadcast::channel(EVENT_BROADCAST_BUFFER_SIZE);
    let sink = BroadcastSink { tx: event_tx.clone() };
    let bridge: SharedBridge = Arc::new(Mutex::new(SensorBridge::with_config(bus, sink, &config)));

    let listen_port = if config.listen_port == 0 {
        DEFAULT_LISTEN_PORT
    } else {
        config.listen_port
    };
    let tcp_bridge = Arc::clone(&bridge);
    let tcp_events = event_tx.clone();
    let tcp_server = tokio::spawn(async move {
        if let Err(e) = start_tcp_server(listen_port, tcp_bridge, tcp_events).await {
            error!("TCP server error: {}", e);
        }
    });

    info!(
        tick_ms = config.tick_interval_ms,
        topic = %config.event_topic,
        "sampling loop started"
    );
    let start = Instant::now();
    let mut interval = time::interval(Duration::from_millis(config.tick_interval_ms));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = start.elapsed().as_millis() as u64;
                let mut guard = bridge.lock().await;
                guard.manager_mut().bus_mut().drift();
                let report = guard.update(now);
                if report.samples_taken > 0 || report.samples_failed > 0 {
                    debug!(now, ?report, "tick");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    {
        let mut guard = bridge.lock().await;
        guard.shutdown();
        info!(
            stats = ?guard.scheduler_stats(),
            publish = ?guard.publish_stats(),
            delays_ms = guard.manager().bus().stats().elapsed_delay_ms,
            "bridge stopped"
        );
    }
    tcp_server.abort();
    Ok(())
}

async fn start_tcp_server(
    port: u16,
    bridge: SharedBridge,
    events: broadcast::Sender<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    info!("control plane listening on port {}", port);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("client connected: {}", addr);
                let client_bridge = Arc::clone(&bridge);
                let client_events = events.subscribe();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, client_bridge, client_events).await {
                        warn!("client {} error: {}", addr, e);
                    }
                    info!("client {} disconnected", addr);
                });
            }
            Err(e) => {
                error!("failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    bridge: SharedBridge,
    mut events: broadcast::Receiver<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let writer = Arc::new(Mutex::new(writer));

    let event_writer = Arc::clone(&writer);
    let event_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let mut guard = event_writer.lock().await;
                    if let Err(e) = guard.write_all(format!("{event}\n").as_bytes()).await {
                        warn!("failed to forward event: {}", e);
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "client lagging, events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if line.trim().is_empty() {
                    continue;
                }
                let response = {
                    let mut guard = bridge.lock().await;
                    guard.handle_json(&line)
                };
                match response {
                    Ok(json) => {
                        let mut guard = writer.lock().await;
                        guard.write_all(json.as_bytes()).await?;
                        guard.write_all(b"\n").await?;
                        debug!("sent response: {}", json);
                    }
                    Err(e) => error!("failed to encode response: {}", e),
                }
            }
            Err(e) => {
                error!("error reading from client: {}", e);
                break;
            }
        }
    }

    event_task.abort();
    Ok(())
}
