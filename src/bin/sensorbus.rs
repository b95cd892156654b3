use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use sensorbus::bus::{BusConfig, BusStatus, DEFAULT_FREQUENCY_HZ};
use sensorbus::drivers::Capability;
use sensorbus::protocol::{
    CapabilityPeriod, DeviceDeinitRequest, DeviceEvent, DeviceInitRequest, DeviceUpdateRequest, PeriodList,
    Request, Response, SensorType,
};
use sensorbus::registry::ChipCatalog;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8090";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> CliResult {
    let period_arg = Arg::with_name("period")
        .long("period")
        .value_name("CAPABILITY=MS")
        .help("Sampling period for one capability, e.g. temperature=5000 (0 disables)")
        .takes_value(true)
        .multiple(true)
        .number_of_values(1)
        .validator(|v| parse_period(&v).map(|_| ()));
    let address_arg = Arg::with_name("address")
        .help("7-bit device address, decimal or 0x-prefixed hex")
        .required(true)
        .validator(|v| parse_address(&v).map(|_| ()));

    let matches = App::new("sensorbus")
        .version("0.1.0")
        .author("Sensor Systems Engineering Team")
        .about("Control-plane client for the sensor bus bridge")
        .setting(AppSettings::VersionlessSubcommands)
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Bridge host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Bridge control port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table", "compact"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable verbose output")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("init")
                .about("Bring the bus up")
                .long_about("Checks the pull-ups on both lines, then opens the bus on the given pins")
                .arg(
                    Arg::with_name("bus")
                        .long("bus")
                        .value_name("N")
                        .help("Bus peripheral number")
                        .takes_value(true)
                        .default_value("0"),
                )
                .arg(
                    Arg::with_name("sda")
                        .long("sda")
                        .value_name("PIN")
                        .help("Data line pin")
                        .takes_value(true)
                        .required(true),
                )
                .arg(
                    Arg::with_name("scl")
                        .long("scl")
                        .value_name("PIN")
                        .help("Clock line pin")
                        .takes_value(true)
                        .required(true),
                )
                .arg(
                    Arg::with_name("frequency")
                        .long("frequency")
                        .value_name("HZ")
                        .help("Bus clock frequency")
                        .takes_value(true),
                ),
        )
        .subcommand(SubCommand::with_name("scan").about("List the addresses that acknowledge on the bus"))
        .subcommand(
            SubCommand::with_name("device")
                .about("Device lifecycle")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .subcommand(
                    SubCommand::with_name("add")
                        .about("Initialize a driver at an address")
                        .arg(address_arg.clone())
                        .arg(Arg::with_name("chip").help("Chip name, see `sensorbus chips`").required(true))
                        .arg(period_arg.clone()),
                )
                .subcommand(
                    SubCommand::with_name("update")
                        .about("Change sampling periods of a running device")
                        .arg(address_arg.clone())
                        .arg(period_arg),
                )
                .subcommand(
                    SubCommand::with_name("remove")
                        .about("Release a device and stop sampling it")
                        .arg(address_arg),
                ),
        )
        .subcommand(SubCommand::with_name("chips").about("List the chip names the bridge understands"))
        .subcommand(
            SubCommand::with_name("monitor")
                .about("Stream device events")
                .arg(
                    Arg::with_name("address")
                        .long("address")
                        .value_name("ADDR")
                        .help("Only show events from this address")
                        .takes_value(true)
                        .validator(|v| parse_address(&v).map(|_| ())),
                ),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?;
    let format = matches.value_of("format").unwrap_or("table");
    let verbose = matches.is_present("verbose");

    if verbose {
        println!("{}", "sensorbus control client".bright_blue().bold());
        println!("{} {}:{}", "Connecting to".dimmed(), host, port);
    }

    let request = match matches.subcommand() {
        ("init", Some(sub)) => build_init(sub)?,
        ("scan", _) => Request::BusScan,
        ("device", Some(sub)) => match sub.subcommand() {
            ("add", Some(add)) => Request::DeviceInit(DeviceInitRequest {
                address: required_address(add)?,
                chip_name: add.value_of("chip").unwrap_or_default().to_string(),
                capability_periods: collect_periods(add)?,
            }),
            ("update", Some(update)) => Request::DeviceUpdate(DeviceUpdateRequest {
                address: required_address(update)?,
                capability_periods: collect_periods(update)?,
            }),
            ("remove", Some(remove)) => Request::DeviceDeinit(DeviceDeinitRequest {
                address: required_address(remove)?,
            }),
            _ => return Ok(()),
        },
        ("chips", _) => {
            print_chips(format);
            return Ok(());
        }
        ("monitor", Some(sub)) => {
            let filter = sub.value_of("address").map(parse_address).transpose()?;
            return monitor_events(host, port, format, filter).await;
        }
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Bring the bus up", "sensorbus init --sda 4 --scl 5".bright_cyan());
            println!("  {} Find devices", "sensorbus scan".bright_cyan());
            println!(
                "  {} Sample a sensor",
                "sensorbus device add 0x18 mcp9808 --period temperature=2000".bright_cyan()
            );
            println!("  {} Watch readings", "sensorbus monitor".bright_cyan());
            return Ok(());
        }
    };

    let command = serde_json::to_string(&request)?;
    if verbose {
        println!("{} {}", "->".dimmed(), command.dimmed());
    }
    let response = send_command(host, port, &command).await?;
    print_response(&response, format);
    Ok(())
}

fn build_init(matches: &ArgMatches<'_>) -> CliResult<Request> {
    let bus = matches.value_of("bus").unwrap_or("0").parse::<u8>()?;
    let sda = matches.value_of("sda").unwrap_or_default().parse::<u8>()?;
    let scl = matches.value_of("scl").unwrap_or_default().parse::<u8>()?;
    let frequency = match matches.value_of("frequency") {
        Some(hz) => hz.parse::<u32>()?,
        None => DEFAULT_FREQUENCY_HZ,
    };
    Ok(Request::BusInit(BusConfig::new(bus, sda, scl).with_frequency(frequency)))
}

fn required_address(matches: &ArgMatches<'_>) -> CliResult<u8> {
    Ok(parse_address(matches.value_of("address").unwrap_or_default())?)
}

fn collect_periods(matches: &ArgMatches<'_>) -> CliResult<PeriodList> {
    let mut periods = PeriodList::new();
    for value in matches.values_of("period").into_iter().flatten() {
        periods
            .push(parse_period(value)?)
            .map_err(|_| format!("at most {} periods per request", periods.capacity()))?;
    }
    Ok(periods)
}

fn parse_address(value: &str) -> Result<u8, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => value.parse::<u8>(),
    };
    match parsed {
        Ok(address) if address <= 0x7F => Ok(address),
        _ => Err(format!("'{value}' is not a 7-bit address")),
    }
}

/// Accepts wire tags (`AmbientTemperature`) and short names (`temperature`).
/// Anything else is sent through as-is so the bridge can report it.
fn parse_period(value: &str) -> Result<CapabilityPeriod, String> {
    let (name, period) = value
        .split_once('=')
        .ok_or_else(|| format!("'{value}' should look like CAPABILITY=MS"))?;
    let period_ms = period
        .trim()
        .parse::<u64>()
        .map_err(|_| format!("'{period}' is not a period in milliseconds"))?;
    let sensor_type = match name.trim().to_ascii_lowercase().as_str() {
        "temperature" | "temp" | "ambienttemperature" => SensorType::Known(Capability::AmbientTemperature),
        "humidity" | "rh" | "relativehumidity" => SensorType::Known(Capability::RelativeHumidity),
        "pressure" => SensorType::Known(Capability::Pressure),
        "co2" => SensorType::Known(Capability::CO2),
        "altitude" => SensorType::Known(Capability::Altitude),
        _ => SensorType::Unrecognized(name.trim().to_string()),
    };
    Ok(CapabilityPeriod::new(sensor_type, period_ms))
}

fn status_label(status: BusStatus) -> ColoredString {
    let text = format!("{status:?}");
    match status {
        BusStatus::Success => text.bright_green(),
        BusStatus::ErrorPullups | BusStatus::ErrorHang | BusStatus::ErrorShorted => text.bright_red().bold(),
        _ => text.yellow(),
    }
}

fn print_response(response: &str, format: &str) {
    if format == "json" {
        println!("{}", response);
        return;
    }
    let parsed = match serde_json::from_str::<Response>(response) {
        Ok(parsed) => parsed,
        Err(_) => {
            println!("{} Unexpected reply: {}", "❓".blue(), response);
            return;
        }
    };
    if format == "compact" {
        match &parsed {
            Response::Rejected { reason } => println!("{} {}", "REJECTED".red(), reason),
            Response::BusInit { status, .. }
            | Response::BusScan { status, .. }
            | Response::DeviceInit { status, .. }
            | Response::DeviceUpdate { status, .. }
            | Response::DeviceDeinit { status, .. } => println!("{}", status_label(*status)),
        }
        return;
    }

    match parsed {
        Response::BusInit { is_initialized, status } => {
            if is_initialized {
                println!("{} Bus initialized", "✅".green());
            } else {
                println!("{} Bus initialization failed: {}", "❌".red(), status_label(status));
                if status == BusStatus::ErrorPullups {
                    println!("{} Check the pull-up resistors and for a device holding a line low", "💡".yellow());
                }
            }
        }
        Response::BusScan { status, addresses_found } => {
            println!("\n{}", "Bus Scan".bright_blue().bold());
            println!("{}", "════════".bright_blue());
            if addresses_found.is_empty() {
                println!("{}", "No devices responded".dimmed());
            }
            for address in &addresses_found {
                println!("  {}", format!("0x{address:02X}").bright_cyan());
            }
            println!("Status: {}", status_label(status));
            if status.is_bus_fault() {
                println!("{} Scan stopped early; results are partial", "⚠️".yellow());
            }
        }
        Response::DeviceInit {
            address,
            is_success,
            status,
        } => {
            if is_success {
                println!("{} Device {} initialized", "✅".green(), format!("0x{address:02X}").bright_cyan());
            } else {
                println!(
                    "{} Device {} failed: {}",
                    "❌".red(),
                    format!("0x{address:02X}").bright_white(),
                    status_label(status)
                );
            }
        }
        Response::DeviceUpdate { address, status } => {
            println!(
                "{} Device {} updated: {}",
                if status == BusStatus::Success { "✅".green() } else { "⚠️".yellow() },
                format!("0x{address:02X}").bright_cyan(),
                status_label(status)
            );
        }
        Response::DeviceDeinit { address, status } => {
            println!(
                "{} Device {} removed: {}",
                "✅".green(),
                format!("0x{address:02X}").bright_cyan(),
                status_label(status)
            );
        }
        Response::Rejected { reason } => {
            println!("{} Request rejected: {}", "❌".red(), reason.bright_red());
        }
    }
}

fn print_chips(format: &str) {
    let catalog = ChipCatalog::builtin();
    if format == "json" {
        let names: Vec<&str> = catalog.chip_names().collect();
        println!("{}", serde_json::json!(names));
        return;
    }
    for name in catalog.chip_names() {
        println!("  {}", name.bright_cyan());
    }
}

async fn send_command(host: &str, port: u16, command: &str) -> CliResult<String> {
    let addr = format!("{}:{}", host, port);
    let stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("{} Failed to connect to the bridge at {}", "❌".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Bridge is not running. Start it with:", "💡".yellow());
                eprintln!("   {}", "sensorbus-bridge".bright_cyan());
            } else {
                eprintln!("{} Network error: {}", "🔌".yellow(), e.to_string().bright_red());
            }
            return Err(e.into());
        }
    };

    let exchange = async {
        let (reader, mut writer) = stream.into_split();
        writer.write_all(command.as_bytes()).await?;
        writer.write_all(b"\n").await?;

        // Events share the connection; skip them until the reply arrives
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            if serde_json::from_str::<Response>(&line).is_ok() {
                return Ok(line);
            }
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "bridge closed connection",
        ))
    };

    match tokio::time::timeout(COMMAND_TIMEOUT, exchange).await {
        Ok(result) => Ok(result?),
        Err(_) => {
            eprintln!("{} Command timed out after {} seconds", "⏰".yellow(), COMMAND_TIMEOUT.as_secs());
            Err("command timeout".into())
        }
    }
}

async fn monitor_events(host: &str, port: u16, format: &str, filter: Option<u8>) -> CliResult {
    let stream = TcpStream::connect((host, port)).await?;
    println!("{}", "Monitoring device events (Press Ctrl+C to stop)...".bright_blue().bold());

    if format == "table" {
        println!(
            "{}",
            "│ Addr │ Temp (°C) │ RH (%) │ Press (hPa) │ CO2 (ppm) │ Alt (m) │".bright_white()
        );
        println!(
            "{}",
            "├──────┼───────────┼────────┼─────────────┼───────────┼─────────┤".bright_white()
        );
    }

    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await? {
        let Ok(event) = serde_json::from_str::<DeviceEvent>(&line) else {
            continue;
        };
        if filter.is_some_and(|address| address != event.device_address) {
            continue;
        }
        match format {
            "json" => println!("{}", line),
            "compact" => print_event_compact(&event),
            _ => print_event_row(&event),
        }
    }
    Ok(())
}

fn reading(event: &DeviceEvent, capability: Capability) -> Option<f32> {
    event
        .readings
        .iter()
        .find(|reading| reading.capability == capability)
        .map(|reading| reading.value)
}

fn print_event_row(event: &DeviceEvent) {
    let cell = |capability: Capability, width: usize, precision: usize| match reading(event, capability) {
        Some(value) => format!("{value:>width$.precision$}").bright_white(),
        None => format!("{:>width$}", "-").dimmed(),
    };
    let temperature = match reading(event, Capability::AmbientTemperature) {
        Some(value) if value > 40.0 => format!("{value:>9.2}").red(),
        Some(value) => format!("{value:>9.2}").green(),
        None => format!("{:>9}", "-").dimmed(),
    };
    let co2 = match reading(event, Capability::CO2) {
        Some(value) if value > 1500.0 => format!("{value:>9.0}").red(),
        Some(value) if value > 1000.0 => format!("{value:>9.0}").yellow(),
        Some(value) => format!("{value:>9.0}").green(),
        None => format!("{:>9}", "-").dimmed(),
    };
    println!(
        "│ {} │ {} │ {} │ {} │ {} │ {} │",
        format!("0x{:02X}", event.device_address).bright_cyan(),
        temperature,
        cell(Capability::RelativeHumidity, 6, 1),
        cell(Capability::Pressure, 11, 2),
        co2,
        cell(Capability::Altitude, 7, 1),
    );
}

fn print_event_compact(event: &DeviceEvent) {
    let readings: Vec<String> = event
        .readings
        .iter()
        .map(|reading| format!("{}={:.2}{}", reading.capability, reading.value, reading.capability.unit()))
        .collect();
    println!(
        "[{}] {}",
        format!("0x{:02X}", event.device_address).bright_cyan(),
        readings.join(" | ")
    );
}
