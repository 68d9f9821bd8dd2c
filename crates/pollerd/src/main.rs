//! pollerd - Vehicle Diagnostic Poller Daemon
//!
//! Polls the configured PID list from the vehicle ECUs and logs the
//! responses. With the `request` subcommand a single request is sent
//! instead and its response printed.
//!
//! # Usage
//!
//! ```bash
//! pollerd --config pollerd.toml
//! pollerd --config pollerd.toml request 0x7E0 0x7E8 22F190
//! pollerd --config pollerd.toml request --protocol vwtp20 0x200 0x01 22F187
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vehicle_poller::bus::create_bus;
use vehicle_poller::config::{parse_can_id, parse_hex_data, BusConfig};
use vehicle_poller::{
    poll_result_code_name, BusId, CanBus, PollerHandle, PollerRuntime, PollerStatus, Protocol,
};

mod config;
mod sink;

use config::DaemonConfig;
use sink::LogSink;

#[derive(Parser, Debug)]
#[command(name = "pollerd")]
#[command(about = "Vehicle diagnostic poller - periodic OBD-II/UDS polling over CAN")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<String>,

    /// Enable debug output
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,

    /// Log the poller status every n seconds (0 = only at startup)
    #[arg(long, default_value_t = 0)]
    status_interval: u64,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one request and print the response
    Request {
        /// Module tx id (VWTP: channel base id)
        tx_id: String,

        /// Module rx id, 0 for an OBD broadcast (VWTP: logical module id)
        rx_id: String,

        /// Request bytes as hex: service, PID, data
        request: String,

        /// Bus number
        #[arg(short, long, default_value_t = 1)]
        bus: u8,

        /// isotp, isotp-extaddr, isotp-extframe or vwtp20
        #[arg(short, long, default_value = "isotp", value_parser = parse_protocol)]
        protocol: Protocol,

        /// Response timeout in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,
    },
}

fn parse_protocol(s: &str) -> Result<Protocol, String> {
    match s.to_ascii_lowercase().as_str() {
        "isotp" | "isotp-std" => Ok(Protocol::IsoTp),
        "isotp-extaddr" | "isotp-extadr" => Ok(Protocol::IsoTpExtAddr),
        "isotp-extframe" => Ok(Protocol::IsoTpExtFrame),
        "vwtp20" | "vwtp-20" => Ok(Protocol::Vwtp20),
        other => Err(format!("unknown protocol '{}'", other)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose, args.json);

    let config = match &args.config {
        Some(path) => {
            info!("Loading config from: {}", path);
            DaemonConfig::load(path).with_context(|| format!("Failed to load config {}", path))?
        }
        None => {
            info!("No config file provided, using a mock bus");
            DaemonConfig::default()
        }
    };

    let (mut runtime, handle) =
        PollerRuntime::new(config.poller.clone(), Arc::new(LogSink::default()))?;
    for bus_config in config.bus_configs() {
        let id = BusId::new(bus_config.number)
            .with_context(|| format!("Invalid bus number {}", bus_config.number))?;
        let bus = open_bus(&bus_config, id, &handle)?;
        runtime.add_bus(id, bus);
    }
    let task = runtime.spawn();

    let result = match args.command {
        Some(Command::Request {
            tx_id,
            rx_id,
            request,
            bus,
            protocol,
            timeout_ms,
        }) => {
            run_request(
                &handle,
                bus,
                &tx_id,
                &rx_id,
                &request,
                protocol,
                timeout_ms.map(Duration::from_millis),
            )
            .await
        }
        None => run_daemon(&handle, &config, args.status_interval).await,
    };

    handle.shutdown().await?;
    task.await?;
    result
}

fn init_tracing(verbose: bool, json: bool) {
    let default_filter = if verbose {
        "pollerd=debug,vehicle_poller=debug"
    } else {
        "pollerd=info,vehicle_poller=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Open a bus and, for real interfaces, start feeding received frames
#[cfg_attr(not(target_os = "linux"), allow(unused_variables))]
fn open_bus(config: &BusConfig, id: BusId, handle: &PollerHandle) -> Result<Arc<dyn CanBus>> {
    match &config.kind {
        #[cfg(target_os = "linux")]
        vehicle_poller::config::BusKind::SocketCan(can) => {
            let bus = vehicle_poller::bus::socketcan::SocketCanBus::open(&can.interface)?;
            bus.spawn_reader(id, handle.clone())?;
            Ok(Arc::new(bus))
        }
        kind => {
            debug!(bus = %id, "Bus without receive path");
            Ok(create_bus(kind)?)
        }
    }
}

/// Periodic polling until Ctrl-C
async fn run_daemon(handle: &PollerHandle, config: &DaemonConfig, status_interval: u64) -> Result<()> {
    let list = config.poll_list()?;
    let default_bus = config.default_bus_id()?;
    if list.is_empty() {
        warn!("No polls configured");
    } else {
        info!(entries = list.len(), default_bus = %default_bus, "Installing poll list");
        handle.set_pid_list(list, default_bus).await?;
    }
    handle.set_state(config.state, None).await?;

    log_status(&handle.status().await?);

    let mut status_timer = (status_interval > 0).then(|| {
        let period = Duration::from_secs(status_interval);
        tokio::time::interval_at(tokio::time::Instant::now() + period, period)
    });

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                info!("Shutting down");
                return Ok(());
            }
            _ = async {
                match status_timer.as_mut() {
                    Some(timer) => {
                        timer.tick().await;
                    }
                    None => std::future::pending().await,
                }
            } => {
                log_status(&handle.status().await?);
            }
        }
    }
}

fn log_status(status: &[PollerStatus]) {
    for s in status {
        info!(
            bus = %s.bus,
            interface = %s.bus_name,
            state = s.state,
            ticker = s.ticker,
            wait = s.wait,
            paused = s.paused,
            list = s.list_len,
            throttle = s.sequence_max,
            channel = %s.channel,
            single = s.single_active,
            "Poller status"
        );
    }
}

async fn run_request(
    handle: &PollerHandle,
    bus: u8,
    tx_id: &str,
    rx_id: &str,
    request: &str,
    protocol: Protocol,
    timeout: Option<Duration>,
) -> Result<()> {
    let bus = BusId::new(bus).with_context(|| format!("Invalid bus number {}", bus))?;
    let tx_id = parse_can_id(tx_id)?;
    let rx_id = parse_can_id(rx_id)?;
    let request = parse_hex_data(request)?;

    info!(
        bus = %bus,
        tx_id = format!("0x{:X}", tx_id),
        rx_id = format!("0x{:X}", rx_id),
        request = %hex::encode(&request),
        %protocol,
        "Sending single request"
    );

    match handle
        .poll_single_request(bus, tx_id, rx_id, &request, timeout, protocol)
        .await
    {
        Ok(response) => {
            println!("{}", hex::encode(&response));
            Ok(())
        }
        Err(e) => {
            let code = e.result_code();
            anyhow::bail!("Request failed: {} ({}: {})", e, code, poll_result_code_name(code))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_protocol() {
        assert_eq!(parse_protocol("isotp"), Ok(Protocol::IsoTp));
        assert_eq!(parse_protocol("ISOTP-EXTADR"), Ok(Protocol::IsoTpExtAddr));
        assert_eq!(parse_protocol("isotp-extaddr"), Ok(Protocol::IsoTpExtAddr));
        assert_eq!(parse_protocol("isotp-extframe"), Ok(Protocol::IsoTpExtFrame));
        assert_eq!(parse_protocol("VWTP20"), Ok(Protocol::Vwtp20));
        assert!(parse_protocol("kline").is_err());
    }

    #[test]
    fn test_args() {
        let args = Args::try_parse_from([
            "pollerd",
            "--config",
            "pollerd.toml",
            "request",
            "--protocol",
            "vwtp20",
            "0x200",
            "0x01",
            "22F187",
        ])
        .unwrap();
        assert_eq!(args.config.as_deref(), Some("pollerd.toml"));
        match args.command {
            Some(Command::Request {
                tx_id,
                protocol,
                bus,
                timeout_ms,
                ..
            }) => {
                assert_eq!(tx_id, "0x200");
                assert_eq!(protocol, Protocol::Vwtp20);
                assert_eq!(bus, 1);
                assert_eq!(timeout_ms, None);
            }
            None => panic!("expected request subcommand"),
        }
    }
}
