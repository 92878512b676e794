//! # Thermal DAQ
//!
//! Instrument control and experiment orchestration for a thermal-performance
//! characterization rig: a programmable DC supply heats the evaporator of a test
//! article, thermocouples on the evaporator and condenser record the response, and a
//! relay board switches the coolant pump.
//!
//! ## Crate Structure
//!
//! - **`instrument`**: SCPI command grammar, the TCP link with lazy reconnection, the
//!   power-supply driver (write-then-verify setpoints, protection polling) and an
//!   in-process simulated supply.
//! - **`acquisition`**: thermocouple backends (vendor reader program or simulation) and
//!   channel-level acquisition with open-sensor detection.
//! - **`actuator`**: GPIO backends and the named relay bank.
//! - **`experiment`**: the multi-level procedure, sample scheduling, CSV result files
//!   and the single-flight run controller.
//! - **`rig`**: assembles all of the above from a [`config::RigConfig`].
//! - **`config`**, **`logging`**, **`error`**: ambient configuration, structured
//!   logging and the crate error type.

pub mod acquisition;
pub mod actuator;
pub mod config;
pub mod error;
pub mod experiment;
pub mod instrument;
pub mod logging;
pub mod rig;

pub use error::{RigError, RigResult};
pub use rig::Rig;
