//! Relay board control.

pub mod gpio;
pub mod relay;

pub use gpio::{GpioBackend, Level, SimulatedGpio, SysfsGpio};
pub use relay::RelayBank;
