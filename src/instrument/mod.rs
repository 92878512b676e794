//! Programmable power supply: command grammar, link, driver and simulator.

pub mod link;
pub mod power_supply;
pub mod scpi;
pub mod simulator;

pub use link::{Connector, InstrumentLink, TcpConnector};
pub use power_supply::{PowerSupply, ProtectionState, ProtectionSummary, SetpointAck, SupplyLimits};
pub use scpi::ScpiCommand;
pub use simulator::{SimulatedConnector, SimulatedSupply};
