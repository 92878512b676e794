//! CLI entry point for thermal_daq
//!
//! Runs characterization experiments and gives direct access to the rig's
//! instruments. Command results are printed to stdout as JSON; logs go to stderr.
//!
//! # Usage
//!
//! Run the configured power sequence:
//! ```bash
//! thermal_daq --config config/rig.toml run
//! ```
//!
//! Short dry run without hardware:
//! ```bash
//! thermal_daq --simulate run --levels 1,2 --duration 4 --interval 1 --no-pump
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thermal_daq::config::RigConfig;
use thermal_daq::experiment::{RunRequest, RunStatus};
use thermal_daq::{logging, Rig};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "thermal_daq")]
#[command(about = "Thermal characterization rig control", long_about = None)]
struct Cli {
    /// Rig configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use simulated supply, thermocouples and relays
    #[arg(long, global = true)]
    simulate: bool,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an experiment; parameters default to the configuration
    Run {
        /// Power levels in watts, comma separated
        #[arg(long, value_delimiter = ',')]
        levels: Option<Vec<f64>>,

        /// Sampling time per level (s)
        #[arg(long)]
        duration: Option<f64>,

        /// Sampling interval (s)
        #[arg(long)]
        interval: Option<f64>,

        /// Heater resistance (ohm); with --simulate, also the simulated load
        #[arg(long)]
        resistance: Option<f64>,

        /// Leave the coolant pump off
        #[arg(long)]
        no_pump: bool,
    },

    /// Read thermocouples once
    Temps {
        /// Channels to read, comma separated (default: all)
        #[arg(long, value_delimiter = ',')]
        channels: Option<Vec<u8>>,
    },

    /// Power supply access
    Supply {
        #[command(subcommand)]
        action: SupplyAction,
    },

    /// Relay access
    Relay {
        #[command(subcommand)]
        action: RelayAction,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Subcommand)]
enum SupplyAction {
    /// Identification string
    Identify,
    /// Setpoints, measurements, output and protection state
    Status,
    /// Program and verify setpoints (output state unchanged)
    Set {
        /// Voltage (V)
        #[arg(long)]
        voltage: Option<f64>,
        /// Current limit (A)
        #[arg(long)]
        current: Option<f64>,
    },
    /// Clear latched protections
    ClearProtections,
}

#[derive(Subcommand)]
enum RelayAction {
    /// Relay names and states
    List,
    /// Energize a relay for a while, then release it
    Pulse {
        /// Relay name
        name: String,
        /// Hold time (s)
        #[arg(long, default_value = "1.0")]
        seconds: f64,
    },
}

#[derive(Serialize)]
struct SupplyStatus {
    identity: Option<String>,
    voltage_setpoint_v: Option<f64>,
    current_setpoint_a: Option<f64>,
    voltage_v: Option<f64>,
    current_a: Option<f64>,
    output_enabled: Option<bool>,
    protection: thermal_daq::instrument::ProtectionState,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(cli: &Cli) -> Result<RigConfig> {
    let mut config = match &cli.config {
        Some(path) => RigConfig::load_from(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => RigConfig::load()?,
    };
    if cli.simulate {
        config = config.simulated();
    }
    if let Some(level) = &cli.log_level {
        config.application.log_level = level.clone();
    }
    // The simulated supply is built from the configured load
    if let Commands::Run {
        resistance: Some(resistance),
        ..
    } = &cli.command
    {
        config.experiment.load_resistance_ohm = *resistance;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    logging::init_from_config(&config)?;

    if let Commands::Config = cli.command {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let rig = Arc::new(Rig::from_config(config)?);
    let outcome = dispatch(&rig, cli.command).await;
    if let Err(e) = rig.shutdown().await {
        warn!(error = %e, "Rig shutdown incomplete");
    }
    outcome
}

async fn dispatch(rig: &Arc<Rig>, command: Commands) -> Result<()> {
    match command {
        Commands::Run {
            levels,
            duration,
            interval,
            no_pump,
            ..
        } => {
            let mut request = RunRequest::from_config(&rig.config().experiment);
            if let Some(levels) = levels {
                request.power_levels = levels;
            }
            if let Some(duration) = duration {
                request.duration_per_level_s = duration;
            }
            if let Some(interval) = interval {
                request.sample_interval_s = interval;
            }
            if no_pump {
                request.pump_enabled = false;
            }
            run_experiment(rig, request).await
        }
        Commands::Temps { channels } => {
            let thermocouples = rig.thermocouples();
            let reading = match channels {
                Some(channels) => thermocouples.read_channels(&channels).await?,
                None => thermocouples.read_all().await,
            };
            let open = thermocouples.detect_open_sensors();
            if !open.is_empty() {
                warn!(?open, "Open thermocouples");
            }
            print_json(&reading)
        }
        Commands::Supply { action } => supply_command(rig, action).await,
        Commands::Relay { action } => relay_command(rig, action).await,
        Commands::Config => Ok(()),
    }
}

async fn run_experiment(rig: &Arc<Rig>, request: RunRequest) -> Result<()> {
    let started = rig.controller().start_run(request)?;
    info!(run = %started.id, path = %started.output_path.display(), "Run started, Ctrl-C stops it");

    let interrupt = {
        let rig = Arc::clone(rig);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                rig.controller().stop();
            }
        })
    };
    let finished = rig.controller().wait().await;
    interrupt.abort();

    let Some(run) = finished? else {
        bail!("run {} produced no final record", started.id);
    };
    print_json(&run)?;
    if run.status == RunStatus::Error {
        bail!("run {} ended with status error", run.id);
    }
    Ok(())
}

async fn supply_command(rig: &Rig, action: SupplyAction) -> Result<()> {
    let supply = rig.supply();
    match action {
        SupplyAction::Identify => {
            let identity = supply.identify().await?;
            print_json(&identity)
        }
        SupplyAction::Status => {
            let status = SupplyStatus {
                identity: supply.identify().await.ok(),
                voltage_setpoint_v: supply.get_voltage().await.ok(),
                current_setpoint_a: supply.get_current().await.ok(),
                voltage_v: supply.measure_voltage().await.ok(),
                current_a: supply.measure_current().await.ok(),
                output_enabled: supply.get_output_state().await.ok(),
                protection: supply.check_protections().await,
            };
            print_json(&status)
        }
        SupplyAction::Set { voltage, current } => {
            if voltage.is_none() && current.is_none() {
                bail!("nothing to set: pass --voltage and/or --current");
            }
            let mut acks = Vec::new();
            if let Some(volts) = voltage {
                acks.push(supply.set_voltage(volts).await?);
            }
            if let Some(amps) = current {
                acks.push(supply.set_current(amps).await?);
            }
            print_json(&acks)
        }
        SupplyAction::ClearProtections => {
            supply.reset_protections().await?;
            print_json(&supply.check_protections().await)
        }
    }
}

async fn relay_command(rig: &Rig, action: RelayAction) -> Result<()> {
    let relays = rig.relays();
    match action {
        RelayAction::List => print_json(&relays.all_states()),
        RelayAction::Pulse { name, seconds } => {
            if !(seconds.is_finite() && seconds >= 0.0) {
                bail!("hold time must be a non-negative number of seconds");
            }
            relays.activate(&name)?;
            tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
            relays.deactivate(&name)?;
            print_json(&relays.all_states())
        }
    }
}
