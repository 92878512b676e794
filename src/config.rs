//! Rig configuration using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults (the values of the reference rig)
//! 2. A TOML file (e.g. `config/rig.toml`)
//! 3. Environment variables prefixed with `THERMAL_DAQ_`, nested keys joined by `__`
//!
//! # Example
//! ```no_run
//! use thermal_daq::config::RigConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // THERMAL_DAQ_INSTRUMENT__HOST=10.0.0.5 overrides instrument.host
//! let config = RigConfig::load_from("config/rig.toml")?;
//! config.validate()?;
//! println!("Supply at {}:{}", config.instrument.host, config.instrument.port);
//! # Ok(())
//! # }
//! ```

use crate::acquisition::ThermocoupleType;
use crate::error::{RigError, RigResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "THERMAL_DAQ_";

/// Top-level rig configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Programmable DC supply
    pub instrument: InstrumentConfig,
    /// Thermocouple digitizer
    pub digitizer: DigitizerConfig,
    /// Relay board
    pub relays: RelayConfig,
    /// Default experiment parameters and channel groups
    pub experiment: ExperimentConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// How the supply is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentBackend {
    /// Raw TCP (telnet port) session
    Tcp,
    /// In-process simulated supply
    Simulated,
}

/// Power supply addressing and electrical limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    /// Transport backend
    pub backend: InstrumentBackend,
    /// Supply IP address or host name
    pub host: String,
    /// Telnet/SCPI port
    pub port: u16,
    /// Reply timeout (also bounds connection setup)
    pub timeout_ms: u64,
    /// Pause after a fresh connection before the first command
    pub connect_settle_ms: u64,
    /// Pause after non-query commands (the instrument sends no acknowledgement)
    pub command_settle_ms: u64,
    /// Maximum programmable voltage (V)
    pub voltage_max: f64,
    /// Maximum programmable current (A)
    pub current_max: f64,
    /// Voltages above this are logged as high-voltage operations
    pub high_voltage_threshold: f64,
    /// Allowed |readback - requested| for voltage writes (V)
    pub voltage_tolerance: f64,
    /// Allowed |readback - requested| for current writes (A)
    pub current_tolerance: f64,
    /// Decimal places used when formatting voltage setpoints
    pub voltage_decimals: usize,
    /// Decimal places used when formatting current setpoints
    pub current_decimals: usize,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            backend: InstrumentBackend::Tcp,
            host: "192.168.1.100".to_string(),
            port: 5024,
            timeout_ms: 10_000,
            connect_settle_ms: 500,
            command_settle_ms: 100,
            voltage_max: 300.0,
            current_max: 5.2,
            high_voltage_threshold: 50.0,
            voltage_tolerance: 0.5,
            current_tolerance: 0.01,
            voltage_decimals: 2,
            current_decimals: 3,
        }
    }
}

impl InstrumentConfig {
    /// Reply timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// How thermocouples are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigitizerBackend {
    /// Vendor command-line reader
    Mcc,
    /// Deterministic synthetic temperatures
    Simulated,
}

/// Thermocouple digitizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DigitizerConfig {
    /// Acquisition backend
    pub backend: DigitizerBackend,
    /// Number of channels (indices 0..channels)
    pub channels: u8,
    /// Thermocouple type
    pub thermocouple: ThermocoupleType,
    /// Lowest physically plausible temperature (°C)
    pub temp_min: f64,
    /// Highest physically plausible temperature (°C)
    pub temp_max: f64,
    /// Per-channel read timeout
    pub read_timeout_ms: u64,
    /// Reader program for the `mcc` backend
    pub program: String,
}

impl Default for DigitizerConfig {
    fn default() -> Self {
        Self {
            backend: DigitizerBackend::Mcc,
            channels: 8,
            thermocouple: ThermocoupleType::K,
            temp_min: -270.0,
            temp_max: 2000.0,
            read_timeout_ms: 10_000,
            program: "test-usb5203".to_string(),
        }
    }
}

/// GPIO backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpioBackendKind {
    /// Sysfs if present, otherwise simulation
    Auto,
    /// Linux `/sys/class/gpio`
    Sysfs,
    /// In-memory pins
    Simulated,
}

/// Relay board configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// GPIO backend
    pub backend: GpioBackendKind,
    /// Logical relay name -> BCM pin
    pub pins: BTreeMap<String, u8>,
    /// Relay energizes when the pin is driven low
    pub active_low: bool,
    /// Relay driving the coolant pump
    pub pump: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let pins = [("RELAY_1", 26), ("RELAY_2", 20), ("RELAY_3", 21), ("RELAY_4", 16)]
            .into_iter()
            .map(|(name, pin)| (name.to_string(), pin))
            .collect();
        Self {
            backend: GpioBackendKind::Auto,
            pins,
            active_low: true,
            pump: "RELAY_1".to_string(),
        }
    }
}

/// Experiment defaults and channel grouping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Power sequence (W)
    pub power_levels: Vec<f64>,
    /// Time spent sampling each level (s)
    pub duration_per_level_s: f64,
    /// Sampling cadence (s)
    pub sample_interval_s: f64,
    /// Heater resistance (Ω)
    pub load_resistance_ohm: f64,
    /// Run the coolant pump during the experiment
    pub pump_enabled: bool,
    /// Channels on the evaporator
    pub evaporator_channels: Vec<u8>,
    /// Channels on the condenser
    pub condenser_channels: Vec<u8>,
    /// Wait after switching the pump on (s)
    pub pump_settle_s: f64,
    /// Wait after switching the output off between levels (s)
    pub level_settle_s: f64,
    /// Current limit = computed current × margin
    pub current_margin: f64,
    /// Directory receiving one CSV per run
    pub results_dir: PathBuf,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            power_levels: vec![1.0, 2.0, 3.0],
            duration_per_level_s: 600.0,
            sample_interval_s: 60.0,
            load_resistance_ohm: 10.0,
            pump_enabled: true,
            evaporator_channels: vec![0, 1, 2, 3],
            condenser_channels: vec![4, 5, 6, 7],
            pump_settle_s: 5.0,
            level_settle_s: 2.0,
            current_margin: 1.1,
            results_dir: PathBuf::from("results"),
        }
    }
}

impl RigConfig {
    /// Load from defaults and environment only.
    pub fn load() -> RigResult<Self> {
        Ok(Self::figment().extract()?)
    }

    /// Load from a TOML file layered over the defaults, then environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> RigResult<Self> {
        Ok(Figment::from(Serialized::defaults(RigConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(RigConfig::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Force every backend to its simulated variant.
    pub fn simulated(mut self) -> Self {
        self.instrument.backend = InstrumentBackend::Simulated;
        self.digitizer.backend = DigitizerBackend::Simulated;
        self.relays.backend = GpioBackendKind::Simulated;
        self
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> RigResult<()> {
        let invalid = |msg: String| Err(RigError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }
        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return invalid(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        let inst = &self.instrument;
        if inst.host.trim().is_empty() {
            return invalid("instrument.host cannot be empty".into());
        }
        if inst.port == 0 {
            return invalid("instrument.port must be greater than 0".into());
        }
        if inst.timeout_ms == 0 {
            return invalid("instrument.timeout_ms must be greater than 0".into());
        }
        for (name, value) in [
            ("voltage_max", inst.voltage_max),
            ("current_max", inst.current_max),
            ("voltage_tolerance", inst.voltage_tolerance),
            ("current_tolerance", inst.current_tolerance),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return invalid(format!("instrument.{} must be positive, got {}", name, value));
            }
        }

        let daq = &self.digitizer;
        if daq.channels == 0 || daq.channels > 16 {
            return invalid(format!(
                "digitizer.channels must be 1-16, got {}",
                daq.channels
            ));
        }
        if !(daq.temp_min < daq.temp_max) {
            return invalid(format!(
                "digitizer temperature range [{}, {}] is empty",
                daq.temp_min, daq.temp_max
            ));
        }
        if daq.read_timeout_ms == 0 {
            return invalid("digitizer.read_timeout_ms must be greater than 0".into());
        }

        let relays = &self.relays;
        if relays.pins.is_empty() {
            return invalid("relays.pins cannot be empty".into());
        }
        if !relays.pins.contains_key(&relays.pump) {
            return invalid(format!(
                "relays.pump '{}' is not in the relay table",
                relays.pump
            ));
        }
        let mut pins = HashSet::new();
        for (name, pin) in &relays.pins {
            if !pins.insert(pin) {
                return invalid(format!("Duplicate GPIO pin {} (relay {})", pin, name));
            }
        }

        let exp = &self.experiment;
        for ch in exp
            .evaporator_channels
            .iter()
            .chain(exp.condenser_channels.iter())
        {
            if *ch >= daq.channels {
                return invalid(format!(
                    "group channel {} outside digitizer range [0, {})",
                    ch, daq.channels
                ));
            }
        }
        if !(exp.current_margin.is_finite() && exp.current_margin >= 1.0) {
            return invalid(format!(
                "experiment.current_margin must be >= 1, got {}",
                exp.current_margin
            ));
        }
        for (name, value) in [
            ("pump_settle_s", exp.pump_settle_s),
            ("level_settle_s", exp.level_settle_s),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return invalid(format!("experiment.{} must be >= 0, got {}", name, value));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        let config = RigConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.instrument.port, 5024);
        assert_eq!(config.relays.pins.get("RELAY_1"), Some(&26));
        assert_eq!(config.digitizer.thermocouple, ThermocoupleType::K);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [instrument]
            host = "10.0.0.7"
            voltage_max = 60.0

            [digitizer]
            backend = "simulated"
            thermocouple = "t"

            [experiment]
            power_levels = [5.0, 10.0]
            "#
        )
        .unwrap();

        let config = RigConfig::load_from(file.path()).unwrap();
        assert_eq!(config.instrument.host, "10.0.0.7");
        assert_eq!(config.instrument.voltage_max, 60.0);
        // untouched keys keep their defaults
        assert_eq!(config.instrument.port, 5024);
        assert_eq!(config.digitizer.backend, DigitizerBackend::Simulated);
        assert_eq!(config.digitizer.thermocouple, ThermocoupleType::T);
        assert_eq!(config.experiment.power_levels, vec![5.0, 10.0]);
    }

    #[test]
    fn invalid_log_level() {
        let mut config = RigConfig::default();
        config.application.log_level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn pump_must_be_a_known_relay() {
        let mut config = RigConfig::default();
        config.relays.pump = "PUMP".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_pins_rejected() {
        let mut config = RigConfig::default();
        config.relays.pins.insert("RELAY_5".into(), 26);
        assert!(config.validate().is_err());
    }

    #[test]
    fn group_channels_must_exist() {
        let mut config = RigConfig::default();
        config.digitizer.channels = 4;
        // condenser channels 4..7 no longer exist
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("group channel 4"));
    }

    #[test]
    fn simulated_switches_every_backend() {
        let config = RigConfig::default().simulated();
        assert_eq!(config.instrument.backend, InstrumentBackend::Simulated);
        assert_eq!(config.digitizer.backend, DigitizerBackend::Simulated);
        assert_eq!(config.relays.backend, GpioBackendKind::Simulated);
    }
}
