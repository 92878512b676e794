//! Driver for B&K Precision XLN-series programmable DC supplies.
//!
//! Wraps an [`InstrumentLink`] with the supply's command set:
//!
//! - setpoints are range-checked locally before any bytes are sent
//! - every setpoint write is verified by reading the setpoint back
//! - the questionable-status register is decoded into a [`ProtectionState`]
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use thermal_daq::config::InstrumentConfig;
//! use thermal_daq::instrument::{PowerSupply, TcpConnector};
//!
//! # async fn demo() -> thermal_daq::error::RigResult<()> {
//! let config = InstrumentConfig::default();
//! let connector = TcpConnector::new(
//!     config.host.clone(),
//!     config.port,
//!     config.timeout(),
//!     std::time::Duration::from_millis(config.connect_settle_ms),
//! );
//! let supply = PowerSupply::from_config(&config, Arc::new(connector));
//! supply.set_voltage(3.16).await?;
//! supply.output_on().await?;
//! println!("{:.3} A", supply.measure_current().await?);
//! # Ok(())
//! # }
//! ```

use crate::config::InstrumentConfig;
use crate::error::{DecodeError, RigError, RigResult};
use crate::instrument::link::{Connector, InstrumentLink};
use crate::instrument::scpi::{self, ScpiCommand};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Electrical limits and verification tolerances.
#[derive(Debug, Clone, PartialEq)]
pub struct SupplyLimits {
    /// Maximum programmable voltage (V)
    pub voltage_max: f64,
    /// Maximum programmable current (A)
    pub current_max: f64,
    /// Voltages above this are flagged as high-voltage
    pub high_voltage_threshold: f64,
    /// Voltage readback tolerance (V)
    pub voltage_tolerance: f64,
    /// Current readback tolerance (A)
    pub current_tolerance: f64,
    /// Decimals for voltage setpoints
    pub voltage_decimals: usize,
    /// Decimals for current setpoints
    pub current_decimals: usize,
}

impl Default for SupplyLimits {
    fn default() -> Self {
        Self::from(&InstrumentConfig::default())
    }
}

impl From<&InstrumentConfig> for SupplyLimits {
    fn from(config: &InstrumentConfig) -> Self {
        Self {
            voltage_max: config.voltage_max,
            current_max: config.current_max,
            high_voltage_threshold: config.high_voltage_threshold,
            voltage_tolerance: config.voltage_tolerance,
            current_tolerance: config.current_tolerance,
            voltage_decimals: config.voltage_decimals,
            current_decimals: config.current_decimals,
        }
    }
}

/// Result of a verified setpoint write.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SetpointAck {
    /// Value requested by the caller
    pub requested: f64,
    /// Value the instrument reported afterwards
    pub readback: f64,
    /// Request exceeded the high-voltage threshold
    pub high_voltage: bool,
}

/// Condensed protection status.
///
/// When several bits are set the highest-priority one is reported: OVP, then OCP, then OPP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionSummary {
    /// No protection active
    Ok,
    /// Over-voltage protection tripped
    OvpActive,
    /// Over-current protection tripped
    OcpActive,
    /// Over-power protection tripped
    OppActive,
    /// Status could not be read; treated as a trip
    Error,
}

impl fmt::Display for ProtectionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProtectionSummary::Ok => "ok",
            ProtectionSummary::OvpActive => "ovp_active",
            ProtectionSummary::OcpActive => "ocp_active",
            ProtectionSummary::OppActive => "opp_active",
            ProtectionSummary::Error => "error",
        };
        f.write_str(label)
    }
}

/// Decoded questionable-status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionState {
    /// Bit 0
    pub over_voltage: bool,
    /// Bit 1
    pub over_current: bool,
    /// Bit 2
    pub over_power: bool,
    /// Highest-priority condition
    pub summary: ProtectionSummary,
}

impl ProtectionState {
    const OVP_BIT: u32 = 1 << 0;
    const OCP_BIT: u32 = 1 << 1;
    const OPP_BIT: u32 = 1 << 2;

    /// Decode the register value.
    pub fn from_register(bits: u32) -> Self {
        let over_voltage = bits & Self::OVP_BIT != 0;
        let over_current = bits & Self::OCP_BIT != 0;
        let over_power = bits & Self::OPP_BIT != 0;
        let summary = if over_voltage {
            ProtectionSummary::OvpActive
        } else if over_current {
            ProtectionSummary::OcpActive
        } else if over_power {
            ProtectionSummary::OppActive
        } else {
            ProtectionSummary::Ok
        };
        Self {
            over_voltage,
            over_current,
            over_power,
            summary,
        }
    }

    /// State reported when the register could not be read.
    pub fn poll_failed() -> Self {
        Self {
            over_voltage: false,
            over_current: false,
            over_power: false,
            summary: ProtectionSummary::Error,
        }
    }

    /// No protection active and the poll succeeded.
    pub fn is_ok(&self) -> bool {
        self.summary == ProtectionSummary::Ok
    }
}

/// XLN-series supply driver.
#[derive(Debug)]
pub struct PowerSupply {
    link: InstrumentLink,
    limits: SupplyLimits,
}

impl PowerSupply {
    /// Driver over an existing link.
    pub fn new(link: InstrumentLink, limits: SupplyLimits) -> Self {
        Self { link, limits }
    }

    /// Driver using the configured timeouts and limits.
    pub fn from_config(config: &InstrumentConfig, connector: Arc<dyn Connector>) -> Self {
        let link = InstrumentLink::new(
            connector,
            config.timeout(),
            Duration::from_millis(config.command_settle_ms),
        );
        Self::new(link, SupplyLimits::from(config))
    }

    /// Configured limits.
    pub fn limits(&self) -> &SupplyLimits {
        &self.limits
    }

    /// Whether a session is open.
    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Close the session.
    pub async fn disconnect(&self) {
        self.link.disconnect().await;
    }

    /// Program the output voltage and verify it.
    #[instrument(skip(self), err)]
    pub async fn set_voltage(&self, volts: f64) -> RigResult<SetpointAck> {
        if !(0.0..=self.limits.voltage_max).contains(&volts) {
            return Err(RigError::SetpointOutOfRange {
                quantity: "voltage",
                value: volts,
                max: self.limits.voltage_max,
                unit: "V",
            });
        }
        let high_voltage = volts > self.limits.high_voltage_threshold;
        if high_voltage {
            warn!(
                volts,
                threshold = self.limits.high_voltage_threshold,
                "High-voltage setpoint"
            );
        }

        self.command(&ScpiCommand::set_voltage(volts, self.limits.voltage_decimals))
            .await?;
        let readback = self.get_voltage().await?;
        verify("voltage", volts, readback, self.limits.voltage_tolerance)?;

        info!(volts, readback, "Voltage set");
        Ok(SetpointAck {
            requested: volts,
            readback,
            high_voltage,
        })
    }

    /// Program the current limit and verify it.
    #[instrument(skip(self), err)]
    pub async fn set_current(&self, amps: f64) -> RigResult<SetpointAck> {
        if !(0.0..=self.limits.current_max).contains(&amps) {
            return Err(RigError::SetpointOutOfRange {
                quantity: "current",
                value: amps,
                max: self.limits.current_max,
                unit: "A",
            });
        }

        self.command(&ScpiCommand::set_current(amps, self.limits.current_decimals))
            .await?;
        let readback = self.get_current().await?;
        verify("current", amps, readback, self.limits.current_tolerance)?;

        info!(amps, readback, "Current set");
        Ok(SetpointAck {
            requested: amps,
            readback,
            high_voltage: false,
        })
    }

    /// Voltage setpoint as reported by the instrument.
    pub async fn get_voltage(&self) -> RigResult<f64> {
        self.query_numeric(&ScpiCommand::voltage_setpoint()).await
    }

    /// Current setpoint as reported by the instrument.
    pub async fn get_current(&self) -> RigResult<f64> {
        self.query_numeric(&ScpiCommand::current_setpoint()).await
    }

    /// Measured output voltage.
    #[instrument(skip(self), err)]
    pub async fn measure_voltage(&self) -> RigResult<f64> {
        self.query_numeric(&ScpiCommand::measure_voltage()).await
    }

    /// Measured output current.
    #[instrument(skip(self), err)]
    pub async fn measure_current(&self) -> RigResult<f64> {
        self.query_numeric(&ScpiCommand::measure_current()).await
    }

    /// Enable the output.
    pub async fn output_on(&self) -> RigResult<()> {
        self.set_output(true).await
    }

    /// Disable the output.
    pub async fn output_off(&self) -> RigResult<()> {
        self.set_output(false).await
    }

    /// Enable or disable the output.
    #[instrument(skip(self), err)]
    pub async fn set_output(&self, enabled: bool) -> RigResult<()> {
        self.command(&ScpiCommand::output(enabled)).await?;
        info!(enabled, "Output switched");
        Ok(())
    }

    /// Whether the output is enabled.
    pub async fn get_output_state(&self) -> RigResult<bool> {
        self.query_decoded(&ScpiCommand::output_state(), scpi::decode_on_off)
            .await
    }

    /// Poll the protection register.
    ///
    /// Never fails: a communication or decode failure yields
    /// [`ProtectionSummary::Error`].
    pub async fn check_protections(&self) -> ProtectionState {
        let decoded = self
            .query_decoded(&ScpiCommand::protection_status(), scpi::decode_bitfield)
            .await;
        match decoded {
            Ok(bits) => {
                let state = ProtectionState::from_register(bits);
                if !state.is_ok() {
                    warn!(bits, summary = %state.summary, "Protection active");
                }
                state
            }
            Err(e) => {
                warn!(error = %e, "Protection poll failed");
                ProtectionState::poll_failed()
            }
        }
    }

    /// Clear status and latched protections (`*CLS`).
    #[instrument(skip(self), err)]
    pub async fn reset_protections(&self) -> RigResult<()> {
        self.command(&ScpiCommand::clear_status()).await
    }

    /// Identification string.
    pub async fn identify(&self) -> RigResult<String> {
        self.query_decoded(&ScpiCommand::identify(), scpi::decode_text)
            .await
    }

    async fn command(&self, command: &ScpiCommand) -> RigResult<()> {
        self.link.send(command).await.map(|_| ())
    }

    async fn query(&self, command: &ScpiCommand) -> RigResult<String> {
        self.link
            .send(command)
            .await?
            .ok_or_else(|| RigError::Communication {
                command: command.text().to_string(),
                reason: "query produced no reply".into(),
            })
    }

    async fn query_numeric(&self, command: &ScpiCommand) -> RigResult<f64> {
        self.query_decoded(command, scpi::decode_numeric).await
    }

    /// Query and decode. A malformed reply drops the session: replies can no longer
    /// be matched to queries on it.
    async fn query_decoded<T>(
        &self,
        command: &ScpiCommand,
        decode: fn(&str) -> Result<T, DecodeError>,
    ) -> RigResult<T> {
        let reply = self.query(command).await?;
        match decode(&reply) {
            Ok(value) => Ok(value),
            Err(source) => {
                warn!(command = %command, %reply, "Malformed reply, dropping instrument session");
                self.link.disconnect().await;
                Err(decode_error(command, source))
            }
        }
    }
}

fn decode_error(command: &ScpiCommand, source: DecodeError) -> RigError {
    RigError::Decode {
        command: command.text().to_string(),
        source,
    }
}

fn verify(quantity: &'static str, requested: f64, readback: f64, tolerance: f64) -> RigResult<()> {
    if (readback - requested).abs() > tolerance {
        warn!(quantity, requested, readback, tolerance, "Setpoint verification failed");
        return Err(RigError::VerificationFailed {
            quantity,
            requested,
            readback,
            tolerance,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::SimulatedSupply;
    use tracing_test::traced_test;

    #[test]
    fn register_decoding_priority() {
        assert_eq!(ProtectionState::from_register(0).summary, ProtectionSummary::Ok);
        assert_eq!(ProtectionState::from_register(0b001).summary, ProtectionSummary::OvpActive);
        assert_eq!(ProtectionState::from_register(0b010).summary, ProtectionSummary::OcpActive);
        assert_eq!(ProtectionState::from_register(0b100).summary, ProtectionSummary::OppActive);
        assert_eq!(ProtectionState::from_register(0b111).summary, ProtectionSummary::OvpActive);
        assert_eq!(ProtectionState::from_register(0b110).summary, ProtectionSummary::OcpActive);

        // Unrelated bits are ignored
        let state = ProtectionState::from_register(0b1000);
        assert!(state.is_ok());

        let state = ProtectionState::from_register(0b101);
        assert!(state.over_voltage && !state.over_current && state.over_power);
    }

    #[test]
    fn poll_failure_is_not_ok() {
        let state = ProtectionState::poll_failed();
        assert!(!state.is_ok());
        assert_eq!(state.summary.to_string(), "error");
    }

    #[test]
    fn verification_tolerance() {
        assert!(verify("voltage", 3.16, 3.5, 0.5).is_ok());
        assert!(matches!(
            verify("voltage", 3.16, 3.7, 0.5),
            Err(RigError::VerificationFailed { .. })
        ));
        assert!(verify("current", 0.348, 0.35, 0.01).is_ok());
    }

    #[test]
    fn limits_follow_config() {
        let limits = SupplyLimits::default();
        assert_eq!(limits.voltage_max, 300.0);
        assert_eq!(limits.current_max, 5.2);
        assert_eq!(limits.current_decimals, 3);
    }

    fn simulated() -> (PowerSupply, SimulatedSupply) {
        let sim = SimulatedSupply::new(10.0);
        let supply = PowerSupply::from_config(&InstrumentConfig::default(), Arc::new(sim.connector()));
        (supply, sim)
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn high_voltage_setpoints_are_logged() {
        let (supply, _sim) = simulated();
        let ack = supply.set_voltage(60.0).await.unwrap();
        assert!(ack.high_voltage);
        assert!(logs_contain("High-voltage setpoint"));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn active_protection_is_logged() {
        let (supply, sim) = simulated();
        sim.trip_on_poll(1, 0b100);
        let state = supply.check_protections().await;
        assert_eq!(state.summary, ProtectionSummary::OppActive);
        assert!(logs_contain("Protection active"));
    }
}
