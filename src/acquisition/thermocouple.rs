//! Thermocouple digitizer access.
//!
//! [`TemperatureAcquisition`] reads channels through a [`ThermocoupleBackend`] and
//! turns every per-channel failure into an absent value, so one broken sensor never
//! prevents reading the others. Values outside the digitizer's physical range (the
//! classic open-thermocouple artefact) are treated the same way.
//!
//! Backends:
//! - [`MccBackend`]: Measurement Computing USB-5203 through the vendor's
//!   `test-usb5203` command-line reader
//! - [`SimulatedThermocouples`]: deterministic temperatures with injectable faults

use crate::acquisition::reading::ChannelReading;
use crate::config::DigitizerConfig;
use crate::error::{RigError, RigResult};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[allow(clippy::expect_used)]
static FIRST_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[-+]?\d*\.?\d+").expect("Invalid temperature regex"));

/// Thermocouple calibration type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ThermocoupleType {
    /// Iron / constantan
    J,
    /// Chromel / alumel
    K,
    /// Platinum-rhodium 13 %
    R,
    /// Platinum-rhodium 10 %
    S,
    /// Copper / constantan
    T,
    /// Nicrosil / nisil
    N,
    /// Chromel / constantan
    E,
    /// Platinum-rhodium 30 % / 6 %
    B,
}

impl fmt::Display for ThermocoupleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letter = match self {
            ThermocoupleType::J => "J",
            ThermocoupleType::K => "K",
            ThermocoupleType::R => "R",
            ThermocoupleType::S => "S",
            ThermocoupleType::T => "T",
            ThermocoupleType::N => "N",
            ThermocoupleType::E => "E",
            ThermocoupleType::B => "B",
        };
        f.write_str(letter)
    }
}

impl FromStr for ThermocoupleType {
    type Err = RigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "J" => Ok(ThermocoupleType::J),
            "K" => Ok(ThermocoupleType::K),
            "R" => Ok(ThermocoupleType::R),
            "S" => Ok(ThermocoupleType::S),
            "T" => Ok(ThermocoupleType::T),
            "N" => Ok(ThermocoupleType::N),
            "E" => Ok(ThermocoupleType::E),
            "B" => Ok(ThermocoupleType::B),
            other => Err(RigError::Configuration(format!(
                "Invalid thermocouple type '{}'. Must be one of: J, K, R, S, T, N, E, B",
                other
            ))),
        }
    }
}

impl TryFrom<String> for ThermocoupleType {
    type Error = RigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ThermocoupleType> for String {
    fn from(value: ThermocoupleType) -> Self {
        value.to_string()
    }
}

/// Raw single-channel reads from a digitizer.
#[async_trait]
pub trait ThermocoupleBackend: Send + Sync {
    /// Read one channel in °C, without plausibility checks.
    async fn read_raw(&self, channel: u8) -> RigResult<f64>;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

/// USB-5203 through the MCC Linux command-line reader.
#[derive(Debug, Clone)]
pub struct MccBackend {
    program: String,
    thermocouple: ThermocoupleType,
    timeout: Duration,
}

impl MccBackend {
    /// Backend invoking `program -ch <n> -type <tc>`.
    pub fn new(program: impl Into<String>, thermocouple: ThermocoupleType, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            thermocouple,
            timeout,
        }
    }

    /// Backend from the digitizer section of the configuration.
    pub fn from_config(config: &DigitizerConfig) -> Self {
        Self::new(
            config.program.clone(),
            config.thermocouple,
            Duration::from_millis(config.read_timeout_ms),
        )
    }
}

/// First decimal number in the reader's output.
fn parse_temperature(output: &str) -> Option<f64> {
    FIRST_NUMBER
        .find(output)
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

#[async_trait]
impl ThermocoupleBackend for MccBackend {
    async fn read_raw(&self, channel: u8) -> RigResult<f64> {
        let failure = |reason: String| RigError::Digitizer { channel, reason };

        let mut command = tokio::process::Command::new(&self.program);
        command
            .arg("-ch")
            .arg(channel.to_string())
            .arg("-type")
            .arg(self.thermocouple.to_string())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| failure(format!("timed out after {} ms", self.timeout.as_millis())))?
            .map_err(|e| failure(format!("cannot run {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failure(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_temperature(&stdout)
            .ok_or_else(|| failure(format!("no temperature in output '{}'", stdout.trim())))
    }

    fn name(&self) -> &'static str {
        "mcc"
    }
}

#[derive(Debug, Default)]
struct SimulatedChannels {
    values: BTreeMap<u8, f64>,
    open: BTreeSet<u8>,
    failing: BTreeSet<u8>,
}

/// Deterministic synthetic thermocouples.
///
/// Channel `n` reads `40 - 2.5·n` °C unless overridden, so lower channels
/// (the evaporator group by default) are warmer than higher ones.
#[derive(Debug, Clone, Default)]
pub struct SimulatedThermocouples {
    state: Arc<parking_lot::Mutex<SimulatedChannels>>,
}

impl SimulatedThermocouples {
    /// Raw value produced by an open channel.
    pub const OPEN_ARTEFACT: f64 = -9999.0;

    /// Simulator with default temperatures.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fix the temperature of a channel.
    pub fn set_temperature(&self, channel: u8, celsius: f64) {
        self.state.lock().values.insert(channel, celsius);
    }

    /// Disconnect (or reconnect) a channel; it then reads [`Self::OPEN_ARTEFACT`].
    pub fn set_open(&self, channel: u8, open: bool) {
        let mut state = self.state.lock();
        if open {
            state.open.insert(channel);
        } else {
            state.open.remove(&channel);
        }
    }

    /// Make reads of a channel fail outright.
    pub fn set_failing(&self, channel: u8, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing.insert(channel);
        } else {
            state.failing.remove(&channel);
        }
    }
}

#[async_trait]
impl ThermocoupleBackend for SimulatedThermocouples {
    async fn read_raw(&self, channel: u8) -> RigResult<f64> {
        let state = self.state.lock();
        if state.failing.contains(&channel) {
            return Err(RigError::Digitizer {
                channel,
                reason: "simulated read failure".into(),
            });
        }
        if state.open.contains(&channel) {
            return Ok(Self::OPEN_ARTEFACT);
        }
        Ok(state
            .values
            .get(&channel)
            .copied()
            .unwrap_or(40.0 - 2.5 * f64::from(channel)))
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

/// Channel-level temperature acquisition with sensor-fault handling.
pub struct TemperatureAcquisition {
    backend: Arc<dyn ThermocoupleBackend>,
    channels: u8,
    temp_min: f64,
    temp_max: f64,
    last: parking_lot::Mutex<ChannelReading>,
}

impl TemperatureAcquisition {
    /// Acquisition over `channels` channels accepting values in `[temp_min, temp_max]`.
    pub fn new(backend: Arc<dyn ThermocoupleBackend>, channels: u8, temp_min: f64, temp_max: f64) -> Self {
        info!(backend = backend.name(), channels, "Temperature acquisition ready");
        Self {
            backend,
            channels,
            temp_min,
            temp_max,
            last: parking_lot::Mutex::new(ChannelReading::new()),
        }
    }

    /// Acquisition using the configured channel count and range.
    pub fn from_config(config: &DigitizerConfig, backend: Arc<dyn ThermocoupleBackend>) -> Self {
        Self::new(backend, config.channels, config.temp_min, config.temp_max)
    }

    /// Number of channels.
    pub fn channel_count(&self) -> u8 {
        self.channels
    }

    fn validate(&self, channel: u8) -> RigResult<()> {
        if channel >= self.channels {
            return Err(RigError::InvalidChannel {
                channel,
                count: self.channels,
            });
        }
        Ok(())
    }

    async fn sample(&self, channel: u8) -> Option<f64> {
        match self.backend.read_raw(channel).await {
            Ok(celsius) if (self.temp_min..=self.temp_max).contains(&celsius) => {
                debug!(channel, celsius, "Temperature read");
                Some(celsius)
            }
            Ok(celsius) => {
                warn!(
                    channel,
                    celsius,
                    min = self.temp_min,
                    max = self.temp_max,
                    "Implausible temperature, possible open thermocouple"
                );
                None
            }
            Err(e) => {
                warn!(channel, error = %e, "Temperature read failed");
                None
            }
        }
    }

    /// Read one channel. An out-of-range channel index is a validation error;
    /// a sensor fault is `Ok(None)`.
    pub async fn read_channel(&self, channel: u8) -> RigResult<Option<f64>> {
        self.validate(channel)?;
        let value = self.sample(channel).await;
        self.last.lock().insert(channel, value);
        Ok(value)
    }

    /// Read a set of channels, each independently.
    pub async fn read_channels(&self, channels: &[u8]) -> RigResult<ChannelReading> {
        for channel in channels {
            self.validate(*channel)?;
        }
        let mut reading = ChannelReading::new();
        for channel in channels {
            reading.insert(*channel, self.sample(*channel).await);
        }
        self.last.lock().merge(&reading);
        Ok(reading)
    }

    /// Read every channel.
    pub async fn read_all(&self) -> ChannelReading {
        let mut reading = ChannelReading::new();
        for channel in 0..self.channels {
            reading.insert(channel, self.sample(channel).await);
        }
        self.last.lock().merge(&reading);
        debug!(
            valid = reading.valid_count(),
            total = self.channels,
            "Read all channels"
        );
        reading
    }

    /// Read the listed channels and average the valid ones.
    pub async fn average(&self, channels: &[u8]) -> RigResult<Option<f64>> {
        let reading = self.read_channels(channels).await?;
        let average = reading.average(channels);
        if average.is_none() {
            warn!(?channels, "No valid reading to average");
        }
        Ok(average)
    }

    /// Channels whose most recent read produced no value.
    pub fn detect_open_sensors(&self) -> Vec<u8> {
        self.last.lock().open_channels()
    }

    /// Read every channel, then report the open ones.
    pub async fn check_open_sensors(&self) -> Vec<u8> {
        self.read_all().await;
        let open = self.detect_open_sensors();
        if !open.is_empty() {
            warn!(?open, "Open thermocouples detected");
        }
        open
    }

    /// Most recent value of every channel read so far.
    pub fn last_reading(&self) -> ChannelReading {
        self.last.lock().clone()
    }
}

impl fmt::Debug for TemperatureAcquisition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemperatureAcquisition")
            .field("backend", &self.backend.name())
            .field("channels", &self.channels)
            .field("range", &(self.temp_min, self.temp_max))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acquisition() -> (SimulatedThermocouples, TemperatureAcquisition) {
        let sim = SimulatedThermocouples::new();
        let daq = TemperatureAcquisition::new(Arc::new(sim.clone()), 8, -270.0, 2000.0);
        (sim, daq)
    }

    #[test]
    fn thermocouple_type_parsing() {
        assert_eq!("k".parse::<ThermocoupleType>().unwrap(), ThermocoupleType::K);
        assert_eq!(" B ".parse::<ThermocoupleType>().unwrap(), ThermocoupleType::B);
        assert!("X".parse::<ThermocoupleType>().is_err());
        assert_eq!(ThermocoupleType::J.to_string(), "J");
    }

    #[test]
    fn reader_output_parsing() {
        assert_eq!(parse_temperature("23.45"), Some(23.45));
        assert_eq!(parse_temperature("Channel 3: -12.5 C"), Some(3.0));
        assert_eq!(parse_temperature("Temperature = -12.5"), Some(-12.5));
        assert_eq!(parse_temperature("no data"), None);
    }

    #[tokio::test]
    async fn defaults_are_deterministic() {
        let (_, daq) = acquisition();
        assert_eq!(daq.read_channel(0).await.unwrap(), Some(40.0));
        assert_eq!(daq.read_channel(7).await.unwrap(), Some(22.5));
    }

    #[tokio::test]
    async fn invalid_channel_is_rejected() {
        let (_, daq) = acquisition();
        assert!(matches!(
            daq.read_channel(8).await,
            Err(RigError::InvalidChannel { channel: 8, count: 8 })
        ));
        assert!(daq.read_channels(&[0, 9]).await.is_err());
    }

    #[tokio::test]
    async fn faults_do_not_block_other_channels() {
        let (sim, daq) = acquisition();
        sim.set_open(2, true);
        sim.set_failing(5, true);

        let reading = daq.read_all().await;
        assert_eq!(reading.len(), 8);
        assert_eq!(reading.valid_count(), 6);
        assert_eq!(reading.get(2), None);
        assert_eq!(reading.get(5), None);
        assert_eq!(reading.get(3), Some(32.5));
        assert_eq!(daq.detect_open_sensors(), vec![2, 5]);
    }

    #[tokio::test]
    async fn out_of_range_values_are_faults() {
        let (sim, daq) = acquisition();
        sim.set_temperature(1, 2500.0);
        assert_eq!(daq.read_channel(1).await.unwrap(), None);
        sim.set_temperature(1, 2000.0);
        assert_eq!(daq.read_channel(1).await.unwrap(), Some(2000.0));
    }

    #[tokio::test]
    async fn average_over_group() {
        let (sim, daq) = acquisition();
        assert_eq!(daq.average(&[0, 1, 2, 3]).await.unwrap(), Some(36.25));

        sim.set_open(0, true);
        sim.set_open(1, true);
        assert_eq!(daq.average(&[0, 1, 2, 3]).await.unwrap(), Some(33.75));

        sim.set_open(2, true);
        sim.set_open(3, true);
        assert_eq!(daq.average(&[0, 1, 2, 3]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn open_sensor_detection_tracks_latest_read() {
        let (sim, daq) = acquisition();
        // Nothing read yet
        assert!(daq.detect_open_sensors().is_empty());

        sim.set_open(4, true);
        assert_eq!(daq.check_open_sensors().await, vec![4]);

        sim.set_open(4, false);
        daq.read_channel(4).await.unwrap();
        assert!(daq.detect_open_sensors().is_empty());
    }
}
