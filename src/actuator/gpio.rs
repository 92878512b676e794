//! Digital output backends for the relay board.

use crate::error::{RigError, RigResult};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Default sysfs GPIO root.
pub const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

/// Electrical pin level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// 0 V
    Low,
    /// 3.3 V
    High,
}

impl Level {
    fn as_sysfs(self) -> &'static str {
        match self {
            Level::Low => "0",
            Level::High => "1",
        }
    }
}

/// Output-only GPIO access by BCM pin number.
pub trait GpioBackend: Send + Sync {
    /// Configure `pin` as an output driving `initial`.
    fn configure_output(&self, pin: u8, initial: Level) -> RigResult<()>;

    /// Drive `pin`.
    fn write(&self, pin: u8, level: Level) -> RigResult<()>;

    /// Return `pin` to the system.
    fn release(&self, pin: u8) -> RigResult<()>;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

/// Linux sysfs GPIO (`/sys/class/gpio`).
#[derive(Debug, Clone)]
pub struct SysfsGpio {
    root: PathBuf,
}

impl SysfsGpio {
    /// Backend rooted at [`SYSFS_GPIO_ROOT`].
    pub fn new() -> Self {
        Self::with_root(SYSFS_GPIO_ROOT)
    }

    /// Backend rooted elsewhere.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Whether the default sysfs interface exists on this machine.
    pub fn available() -> bool {
        Path::new(SYSFS_GPIO_ROOT).exists()
    }

    fn pin_dir(&self, pin: u8) -> PathBuf {
        self.root.join(format!("gpio{}", pin))
    }

    fn write_file(&self, pin: u8, path: &Path, contents: &str) -> RigResult<()> {
        fs::write(path, contents).map_err(|e| RigError::Gpio {
            pin,
            reason: format!("writing '{}' to {}: {}", contents, path.display(), e),
        })
    }
}

impl Default for SysfsGpio {
    fn default() -> Self {
        Self::new()
    }
}

impl GpioBackend for SysfsGpio {
    fn configure_output(&self, pin: u8, initial: Level) -> RigResult<()> {
        if !self.pin_dir(pin).exists() {
            self.write_file(pin, &self.root.join("export"), &pin.to_string())?;
        }
        // "high"/"low" sets the direction and the initial level in one write
        let direction = match initial {
            Level::Low => "low",
            Level::High => "high",
        };
        self.write_file(pin, &self.pin_dir(pin).join("direction"), direction)
    }

    fn write(&self, pin: u8, level: Level) -> RigResult<()> {
        self.write_file(pin, &self.pin_dir(pin).join("value"), level.as_sysfs())
    }

    fn release(&self, pin: u8) -> RigResult<()> {
        self.write_file(pin, &self.root.join("unexport"), &pin.to_string())
    }

    fn name(&self) -> &'static str {
        "sysfs"
    }
}

#[derive(Debug, Default)]
struct SimulatedPins {
    levels: BTreeMap<u8, Level>,
    released: BTreeSet<u8>,
    failing: BTreeSet<u8>,
}

/// In-memory pins for machines without GPIO.
#[derive(Debug, Clone, Default)]
pub struct SimulatedGpio {
    pins: Arc<Mutex<SimulatedPins>>,
}

impl SimulatedGpio {
    /// Empty pin set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last level driven on `pin`.
    pub fn level(&self, pin: u8) -> Option<Level> {
        self.pins.lock().levels.get(&pin).copied()
    }

    /// Whether `pin` has been released.
    pub fn is_released(&self, pin: u8) -> bool {
        self.pins.lock().released.contains(&pin)
    }

    /// Make writes to `pin` fail.
    pub fn set_failing(&self, pin: u8, failing: bool) {
        let mut pins = self.pins.lock();
        if failing {
            pins.failing.insert(pin);
        } else {
            pins.failing.remove(&pin);
        }
    }
}

impl GpioBackend for SimulatedGpio {
    fn configure_output(&self, pin: u8, initial: Level) -> RigResult<()> {
        let mut pins = self.pins.lock();
        pins.released.remove(&pin);
        pins.levels.insert(pin, initial);
        debug!(pin, ?initial, "Simulated pin configured");
        Ok(())
    }

    fn write(&self, pin: u8, level: Level) -> RigResult<()> {
        let mut pins = self.pins.lock();
        if pins.failing.contains(&pin) {
            return Err(RigError::Gpio {
                pin,
                reason: "simulated write failure".into(),
            });
        }
        pins.levels.insert(pin, level);
        Ok(())
    }

    fn release(&self, pin: u8) -> RigResult<()> {
        self.pins.lock().released.insert(pin);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysfs_writes_expected_files() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("gpio26")).unwrap();
        let gpio = SysfsGpio::with_root(root.path());

        gpio.configure_output(26, Level::High).unwrap();
        assert_eq!(
            fs::read_to_string(root.path().join("gpio26/direction")).unwrap(),
            "high"
        );
        // Already exported, so no export write
        assert!(!root.path().join("export").exists());

        gpio.write(26, Level::Low).unwrap();
        assert_eq!(fs::read_to_string(root.path().join("gpio26/value")).unwrap(), "0");

        gpio.release(26).unwrap();
        assert_eq!(fs::read_to_string(root.path().join("unexport")).unwrap(), "26");
    }

    #[test]
    fn sysfs_failure_names_the_pin() {
        let root = tempfile::tempdir().unwrap();
        let gpio = SysfsGpio::with_root(root.path().join("missing"));
        let err = gpio.write(20, Level::High).unwrap_err();
        assert!(matches!(err, RigError::Gpio { pin: 20, .. }));
    }

    #[test]
    fn simulated_tracks_levels() {
        let gpio = SimulatedGpio::new();
        gpio.configure_output(16, Level::High).unwrap();
        gpio.write(16, Level::Low).unwrap();
        assert_eq!(gpio.level(16), Some(Level::Low));

        gpio.set_failing(16, true);
        assert!(gpio.write(16, Level::High).is_err());
        assert_eq!(gpio.level(16), Some(Level::Low));

        gpio.release(16).unwrap();
        assert!(gpio.is_released(16));
    }
}
