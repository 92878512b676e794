//! Custom error types for the rig.
//!
//! This module defines the primary error type, `RigError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failures a characterization run can hit, from a rejected
//! setpoint to a dead telnet session or a full disk.
//!
//! ## Error Hierarchy
//!
//! `RigError` variants fall into the categories reported by [`RigError::category`]:
//!
//! - **Validation**: a request was rejected before any I/O happened (setpoint outside
//!   the supply's limits, unknown channel or relay, malformed run request).
//! - **Communication**: the instrument or digitizer did not answer, answered garbage,
//!   or the byte stream broke. The session is dropped and the next command reconnects.
//! - **RunLevel**: a power level cannot be produced by the supply; the level is skipped.
//! - **Fatal**: storage failures and anything else that must abort a run.
//!
//! Sensor faults and protection trips are not errors at this level: they are values
//! (`None` readings, a non-ok [`ProtectionSummary`](crate::instrument::ProtectionSummary))
//! that the orchestrator reacts to.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the rig error type.
pub type RigResult<T> = std::result::Result<T, RigError>;

/// Failure-handling category of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Rejected before any I/O; reported synchronously to the caller.
    Validation,
    /// Timeout, broken stream or malformed reply; recoverable on the next command.
    Communication,
    /// Absent or implausible sensor value.
    SensorFault,
    /// Instrument-side protection tripped (or could not be polled).
    ProtectionTrip,
    /// The requested operating point is outside what the hardware can deliver.
    RunLevel,
    /// Aborts the entire run.
    Fatal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Communication => "communication",
            ErrorCategory::SensorFault => "sensor_fault",
            ErrorCategory::ProtectionTrip => "protection_trip",
            ErrorCategory::RunLevel => "run_level",
            ErrorCategory::Fatal => "fatal",
        };
        write!(f, "{}", label)
    }
}

/// Why an instrument reply could not be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The instrument sent an empty line.
    #[error("empty reply")]
    Empty,
    /// The reply is not a finite decimal number.
    #[error("expected a numeric reply, got '{0}'")]
    NotNumeric(String),
    /// The reply is not an unsigned integer register value.
    #[error("expected an unsigned register value, got '{0}'")]
    NotBitfield(String),
    /// The reply is not one of the on/off tokens.
    #[error("expected 1/ON/0/OFF, got '{0}'")]
    NotOnOff(String),
}

/// Primary error type for the rig.
#[derive(Error, Debug)]
pub enum RigError {
    /// A setpoint is outside the supply's electrical limits.
    ///
    /// Raised by the driver before any bytes are written to the instrument.
    #[error("{quantity} {value} {unit} outside allowed range [0, {max}] {unit}")]
    SetpointOutOfRange {
        /// "voltage" or "current"
        quantity: &'static str,
        /// Requested value
        value: f64,
        /// Upper limit
        max: f64,
        /// Unit symbol
        unit: &'static str,
    },

    /// A digitizer channel index does not exist.
    #[error("channel {channel} outside range [0, {count})")]
    InvalidChannel {
        /// Requested channel
        channel: u8,
        /// Number of channels on the digitizer
        count: u8,
    },

    /// No relay is registered under this logical name.
    #[error("unknown relay '{0}'")]
    UnknownRelay(String),

    /// A run request was malformed.
    #[error("invalid run request: {0}")]
    InvalidRequest(String),

    /// A run is already active; only one may run at a time.
    #[error("an experiment is already running ({0})")]
    RunAlreadyActive(String),

    /// Target power cannot be reached within the supply's limits.
    ///
    /// The orchestrator records this against the level and moves on.
    #[error("{power_w} W into {resistance_ohm} Ω needs {voltage:.2} V / {current:.3} A, beyond supply limits")]
    LimitExceeded {
        /// Requested power
        power_w: f64,
        /// Load resistance
        resistance_ohm: f64,
        /// Computed voltage
        voltage: f64,
        /// Computed current
        current: f64,
    },

    /// Could not open a session with the instrument.
    #[error("failed to connect to {target}: {reason}")]
    Connect {
        /// Human-readable endpoint (host:port, "simulated", ...)
        target: String,
        /// Underlying cause
        reason: String,
    },

    /// A reply did not arrive within the configured timeout.
    #[error("timed out after {timeout_ms} ms waiting for reply to '{command}'")]
    Timeout {
        /// Command that was waiting for a reply
        command: String,
        /// Timeout applied
        timeout_ms: u64,
    },

    /// The byte stream failed or closed while a command was in flight.
    #[error("communication failure during '{command}': {reason}")]
    Communication {
        /// Command being executed
        command: String,
        /// Underlying cause
        reason: String,
    },

    /// A reply arrived but does not follow the expected grammar.
    #[error("malformed reply to '{command}': {source}")]
    Decode {
        /// Command whose reply failed to decode
        command: String,
        /// Decoder failure
        #[source]
        source: DecodeError,
    },

    /// Write-then-verify readback disagreed with the requested value.
    #[error("{quantity} verification failed: requested {requested}, read back {readback} (tolerance {tolerance})")]
    VerificationFailed {
        /// "voltage" or "current"
        quantity: &'static str,
        /// Requested value
        requested: f64,
        /// Value reported by the instrument
        readback: f64,
        /// Allowed absolute deviation
        tolerance: f64,
    },

    /// Digitizer command could not be run or returned a failure status.
    #[error("digitizer read of channel {channel} failed: {reason}")]
    Digitizer {
        /// Channel being read
        channel: u8,
        /// Underlying cause
        reason: String,
    },

    /// GPIO access failed.
    #[error("GPIO pin {pin}: {reason}")]
    Gpio {
        /// BCM pin number
        pin: u8,
        /// Underlying cause
        reason: String,
    },

    /// Result file could not be created or written.
    #[error("storage error on {path}: {source}")]
    Storage {
        /// Result file
        path: PathBuf,
        /// Underlying cause
        #[source]
        source: std::io::Error,
    },

    /// CSV serialization failed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Configuration file parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration values parsed but are semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The run worker died unexpectedly.
    #[error("experiment worker failed: {0}")]
    Worker(String),
}

impl From<figment::Error> for RigError {
    fn from(err: figment::Error) -> Self {
        RigError::Config(Box::new(err))
    }
}

impl RigError {
    /// Failure-handling category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            RigError::SetpointOutOfRange { .. }
            | RigError::InvalidChannel { .. }
            | RigError::UnknownRelay(_)
            | RigError::InvalidRequest(_)
            | RigError::RunAlreadyActive(_)
            | RigError::Configuration(_)
            | RigError::Config(_) => ErrorCategory::Validation,
            RigError::Connect { .. }
            | RigError::Timeout { .. }
            | RigError::Communication { .. }
            | RigError::Decode { .. }
            | RigError::VerificationFailed { .. }
            | RigError::Gpio { .. } => ErrorCategory::Communication,
            RigError::Digitizer { .. } => ErrorCategory::SensorFault,
            RigError::LimitExceeded { .. } => ErrorCategory::RunLevel,
            RigError::Storage { .. } | RigError::Csv(_) | RigError::Worker(_) => {
                ErrorCategory::Fatal
            }
        }
    }

    /// Whether retrying (or continuing with the next level) can succeed.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self.category(), ErrorCategory::Fatal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_recoverable() {
        let err = RigError::SetpointOutOfRange {
            quantity: "voltage",
            value: 301.0,
            max: 300.0,
            unit: "V",
        };
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert!(err.is_recoverable());
        assert_eq!(
            err.to_string(),
            "voltage 301 V outside allowed range [0, 300] V"
        );
    }

    #[test]
    fn storage_errors_are_fatal() {
        let err = RigError::Storage {
            path: PathBuf::from("results/run.csv"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert_eq!(err.category(), ErrorCategory::Fatal);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn decode_error_keeps_source() {
        let err = RigError::Decode {
            command: "VOLT?".into(),
            source: DecodeError::NotNumeric("abc".into()),
        };
        assert_eq!(err.category(), ErrorCategory::Communication);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn limit_exceeded_is_a_run_level_fault() {
        let err = RigError::LimitExceeded {
            power_w: 300.0,
            resistance_ohm: 10.0,
            voltage: 54.77,
            current: 5.477,
        };
        assert_eq!(err.category(), ErrorCategory::RunLevel);
        assert_eq!(ErrorCategory::RunLevel.to_string(), "run_level");
    }
}
