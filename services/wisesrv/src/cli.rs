//! Command line interface
//!
//! Argument types and command handlers for the `wisesrv` binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::config::{ModbusSensorConfig, RestSensorConfig};
use crate::error::{Result, WiseError};
use crate::probe::{probe, DEFAULT_PROBE_TIMEOUT};
use crate::protocols::modbus::ModbusSimulator;
use crate::sensor::{ModbusSensor, RestSensor};

/// Environment prefix for config overrides, e.g. `WISESRV_PORT=502`
pub const ENV_PREFIX: &str = "WISESRV";

#[derive(Parser, Debug)]
#[command(
    name = "wisesrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "WISE-4050 4DI/4DO I/O module sensor",
    long_about = None
)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info", env = "WISESRV_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Console log format (json, pretty, compact, bracketed)
    #[arg(long, default_value = "bracketed", env = "WISESRV_LOG_FORMAT", global = true)]
    pub log_format: String,

    /// Also write logs to this file, rolled daily
    #[arg(long, env = "WISESRV_LOG_FILE", global = true)]
    pub log_file: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Poll both coil blocks once and print the readings
    Read {
        /// Modbus sensor config (yaml, json or toml)
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Write output coils
    Write {
        #[arg(short, long)]
        config: PathBuf,
        /// Coil assignment such as `2=on`; repeatable
        #[arg(long = "coil", value_parser = parse_coil_assignment, required = true)]
        coils: Vec<(u16, bool)>,
    },

    /// Run the sensor with its background monitor until interrupted
    Monitor {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Read the digital input table over the REST interface
    RestRead {
        /// REST sensor config (yaml, json or toml)
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Send one line to a TCP endpoint and print the reply
    Probe {
        /// host:port
        addr: String,
        #[arg(long, default_value = "")]
        payload: String,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Serve a simulated device
    Simulate {
        #[arg(short, long, default_value = "127.0.0.1:5020")]
        bind: String,
        /// Number of coil addresses served
        #[arg(long, default_value_t = 64)]
        coils: u16,
    },
}

/// Parse `N=on|off|true|false|1|0`
pub fn parse_coil_assignment(s: &str) -> std::result::Result<(u16, bool), String> {
    let (index, state) = s
        .split_once('=')
        .ok_or_else(|| format!("expected N=on|off, got '{}'", s))?;
    let index: u16 = index
        .trim()
        .parse()
        .map_err(|_| format!("invalid coil number '{}'", index))?;
    if index == 0 {
        return Err("coil numbers start at 1".to_string());
    }
    let on = match state.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => true,
        "off" | "false" | "0" => false,
        other => return Err(format!("invalid coil state '{}'", other)),
    };
    Ok((index, on))
}

/// `coil<N>` command map from CLI assignments
pub fn coil_command(coils: &[(u16, bool)]) -> Map<String, Value> {
    coils
        .iter()
        .map(|(index, on)| (format!("coil{}", index), Value::Bool(*on)))
        .collect()
}

fn load_modbus_config(path: &Path) -> Result<ModbusSensorConfig> {
    Ok(common::load_config_with_env(path, ENV_PREFIX)?)
}

fn print_json(value: &Value) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| WiseError::protocol(format!("failed to render output: {}", e)))?;
    println!("{}", text);
    Ok(())
}

/// Execute one command to completion
pub async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Read { config } => {
            let config = load_modbus_config(&config)?;
            let sensor = ModbusSensor::new("wisesrv", &config).await?;
            let result = sensor.read().await;
            sensor.close().await?;
            let readings = result?;
            info!("Input coils: {}", readings.input_coils);
            info!("Output coils: {}", readings.output_coils);
            print_json(&readings.to_json())
        },
        Commands::Write { config, coils } => {
            let config = load_modbus_config(&config)?;
            let sensor = ModbusSensor::new("wisesrv", &config).await?;
            let result = sensor.write(&coil_command(&coils)).await;
            sensor.close().await?;
            print_json(&result?.to_json())
        },
        Commands::Monitor { config } => {
            let mut config = load_modbus_config(&config)?;
            if config.poll_interval_ms.is_none() {
                warn!("poll_interval_ms not set, monitoring every 1000 ms");
                config.poll_interval_ms = Some(1000);
            }
            let sensor = ModbusSensor::new("wisesrv", &config).await?;
            info!("Monitoring {}, press Ctrl+C to stop", sensor.name());
            let signal = common::shutdown::wait_for_shutdown().await;
            info!("{} received, closing {}", signal, sensor.name());
            if let Some(latest) = sensor.latest_readings().await {
                print_json(&latest.to_json())?;
            }
            sensor.close().await
        },
        Commands::RestRead { config } => {
            let config: RestSensorConfig = common::load_config_with_env(&config, ENV_PREFIX)?;
            let sensor = RestSensor::new("wisesrv-rest", &config)?;
            let result = sensor.read().await;
            sensor.close().await?;
            print_json(&result?.to_json())
        },
        Commands::Probe {
            addr,
            payload,
            timeout_ms,
        } => {
            let limit = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_PROBE_TIMEOUT);
            let response = probe(&addr, &payload, limit).await?;
            println!("Response from device: {}", response);
            Ok(())
        },
        Commands::Simulate { bind, coils } => {
            let simulator = ModbusSimulator::new(coils);
            let handle = simulator.start(&bind).await?;
            info!("Simulating {} coils on {}", coils, handle.local_addr());
            let signal = common::shutdown::wait_for_shutdown().await;
            info!(
                "{} received after {} connections",
                signal,
                simulator.connections()
            );
            handle.stop().await;
            Ok(())
        },
    }
}
