//! Thermocouple acquisition.

pub mod reading;
pub mod thermocouple;

pub use reading::ChannelReading;
pub use thermocouple::{
    MccBackend, SimulatedThermocouples, TemperatureAcquisition, ThermocoupleBackend,
    ThermocoupleType,
};
