//! Named relays on an active-low relay board.
//!
//! A relay's *active* state is logical: on the default board a relay is energized by
//! driving its pin low. The bank keeps a software model of the commanded state and
//! never reads pins back, so [`RelayBank::toggle`] simply inverts the model.
//!
//! Dropping the bank (or calling [`RelayBank::shutdown`]) deactivates every relay and
//! releases the pins.

use crate::actuator::gpio::{GpioBackend, Level, SimulatedGpio, SysfsGpio};
use crate::config::{GpioBackendKind, RelayConfig};
use crate::error::{RigError, RigResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Logical relay bank.
pub struct RelayBank {
    backend: Arc<dyn GpioBackend>,
    pins: BTreeMap<String, u8>,
    active: RwLock<BTreeMap<String, bool>>,
    active_low: bool,
    shut_down: AtomicBool,
}

impl RelayBank {
    /// Configure every pin as an output in the inactive state.
    pub fn new(
        backend: Arc<dyn GpioBackend>,
        pins: BTreeMap<String, u8>,
        active_low: bool,
    ) -> RigResult<Self> {
        let inactive = pin_level(false, active_low);
        for (name, pin) in &pins {
            backend.configure_output(*pin, inactive)?;
            info!(relay = %name, pin, backend = backend.name(), "Relay initialized inactive");
        }
        let active = pins.keys().map(|name| (name.clone(), false)).collect();
        Ok(Self {
            backend,
            pins,
            active: RwLock::new(active),
            active_low,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Bank from configuration; `auto` falls back to simulation without sysfs.
    pub fn from_config(config: &RelayConfig) -> RigResult<Self> {
        let backend: Arc<dyn GpioBackend> = match config.backend {
            GpioBackendKind::Sysfs => Arc::new(SysfsGpio::new()),
            GpioBackendKind::Simulated => Arc::new(SimulatedGpio::new()),
            GpioBackendKind::Auto if SysfsGpio::available() => Arc::new(SysfsGpio::new()),
            GpioBackendKind::Auto => {
                warn!("GPIO not available, relays run in simulation mode");
                Arc::new(SimulatedGpio::new())
            }
        };
        Self::new(backend, config.pins.clone(), config.active_low)
    }

    /// Relay names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pins.keys().map(String::as_str)
    }

    fn pin(&self, name: &str) -> RigResult<u8> {
        self.pins
            .get(name)
            .copied()
            .ok_or_else(|| RigError::UnknownRelay(name.to_string()))
    }

    fn set(&self, name: &str, active: bool) -> RigResult<()> {
        let pin = self.pin(name)?;
        self.backend.write(pin, pin_level(active, self.active_low))?;
        self.active.write().insert(name.to_string(), active);
        info!(relay = name, pin, active, "Relay switched");
        Ok(())
    }

    /// Energize a relay.
    pub fn activate(&self, name: &str) -> RigResult<()> {
        self.set(name, true)
    }

    /// De-energize a relay.
    pub fn deactivate(&self, name: &str) -> RigResult<()> {
        self.set(name, false)
    }

    /// Invert the commanded state; returns the new state.
    pub fn toggle(&self, name: &str) -> RigResult<bool> {
        let next = !self.state(name)?;
        self.set(name, next)?;
        Ok(next)
    }

    /// Last commanded state.
    pub fn state(&self, name: &str) -> RigResult<bool> {
        self.pin(name)?;
        Ok(self.active.read().get(name).copied().unwrap_or(false))
    }

    /// Last commanded state of every relay.
    pub fn all_states(&self) -> BTreeMap<String, bool> {
        self.active.read().clone()
    }

    /// Deactivate every relay, attempting all of them even if some fail.
    /// Returns the first failure.
    pub fn deactivate_all(&self) -> RigResult<()> {
        let mut first_error = None;
        for name in self.pins.keys() {
            if let Err(e) = self.deactivate(name) {
                error!(relay = %name, error = %e, "Failed to deactivate relay");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                info!("All relays deactivated");
                Ok(())
            }
        }
    }

    /// Deactivate everything and release the pins. Runs once.
    pub fn shutdown(&self) -> RigResult<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.deactivate_all();
        for (name, pin) in &self.pins {
            if let Err(e) = self.backend.release(*pin) {
                warn!(relay = %name, pin, error = %e, "Failed to release pin");
            }
        }
        info!("Relay bank shut down");
        result
    }
}

impl Drop for RelayBank {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!(error = %e, "Relay shutdown incomplete");
        }
    }
}

impl std::fmt::Debug for RelayBank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayBank")
            .field("backend", &self.backend.name())
            .field("pins", &self.pins)
            .field("active_low", &self.active_low)
            .finish()
    }
}

fn pin_level(active: bool, active_low: bool) -> Level {
    if active == active_low {
        Level::Low
    } else {
        Level::High
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bank() -> (SimulatedGpio, RelayBank) {
        let gpio = SimulatedGpio::new();
        let bank = RelayBank::new(Arc::new(gpio.clone()), RelayConfig::default().pins, true).unwrap();
        (gpio, bank)
    }

    #[test]
    fn from_config_uses_simulation_when_asked() {
        let bank = RelayBank::from_config(&RelayConfig {
            backend: GpioBackendKind::Simulated,
            ..RelayConfig::default()
        })
        .unwrap();
        assert!(format!("{:?}", bank).contains("simulated"));
    }

    #[test]
    fn starts_inactive_with_pins_high() {
        let (gpio, bank) = bank();
        assert!(bank.all_states().values().all(|active| !active));
        assert_eq!(gpio.level(26), Some(Level::High));
        assert_eq!(bank.names().count(), 4);
    }

    #[test]
    fn activation_drives_pin_low() {
        let (gpio, bank) = bank();
        bank.activate("RELAY_1").unwrap();
        assert!(bank.state("RELAY_1").unwrap());
        assert_eq!(gpio.level(26), Some(Level::Low));

        bank.deactivate("RELAY_1").unwrap();
        assert_eq!(gpio.level(26), Some(Level::High));
    }

    #[test]
    fn toggle_inverts_model() {
        let (_, bank) = bank();
        assert!(bank.toggle("RELAY_3").unwrap());
        assert!(!bank.toggle("RELAY_3").unwrap());
    }

    #[test]
    fn unknown_relay_is_validation_error() {
        let (_, bank) = bank();
        let err = bank.activate("PUMP").unwrap_err();
        assert!(matches!(err, RigError::UnknownRelay(_)));
        assert!(bank.state("relay_1").is_err());
    }

    #[test]
    fn failed_write_keeps_previous_state() {
        let (gpio, bank) = bank();
        gpio.set_failing(20, true);
        assert!(bank.activate("RELAY_2").is_err());
        assert!(!bank.state("RELAY_2").unwrap());
    }

    #[test]
    fn deactivate_all_attempts_every_relay() {
        let (gpio, bank) = bank();
        bank.activate("RELAY_1").unwrap();
        bank.activate("RELAY_4").unwrap();
        gpio.set_failing(26, true);

        assert!(bank.deactivate_all().is_err());
        assert!(!bank.state("RELAY_4").unwrap());
        assert!(bank.state("RELAY_1").unwrap());
    }

    #[test]
    fn drop_releases_everything() {
        let (gpio, bank) = bank();
        bank.activate("RELAY_2").unwrap();
        drop(bank);
        assert_eq!(gpio.level(20), Some(Level::High));
        assert!(gpio.is_released(20));
        assert!(gpio.is_released(26));
    }
}
