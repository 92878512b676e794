//! Simulated bench shared by the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use thermal_daq::acquisition::{SimulatedThermocouples, ThermocoupleBackend};
use thermal_daq::actuator::{RelayBank, SimulatedGpio};
use thermal_daq::config::RigConfig;
use thermal_daq::experiment::RunRequest;
use thermal_daq::instrument::SimulatedSupply;
use thermal_daq::Rig;

/// GPIO pin of the pump relay in the default relay table.
pub const PUMP_PIN: u8 = 26;

/// A rig wired to simulators, with handles to drive and inspect them.
pub struct Bench {
    pub rig: Arc<Rig>,
    pub supply: SimulatedSupply,
    pub thermocouples: SimulatedThermocouples,
    pub gpio: SimulatedGpio,
    pub results: TempDir,
}

/// Default rig configuration writing results to `results_dir`.
pub fn config(results_dir: &Path) -> RigConfig {
    let mut config = RigConfig::default().simulated();
    config.experiment.results_dir = results_dir.to_path_buf();
    config.experiment.pump_settle_s = 0.5;
    config.experiment.level_settle_s = 0.5;
    config
}

pub fn bench() -> Bench {
    bench_with(|_| {})
}

pub fn bench_with(adjust: impl FnOnce(&mut RigConfig)) -> Bench {
    let thermocouples = SimulatedThermocouples::new();
    bench_with_digitizer(adjust, Arc::new(thermocouples.clone()), thermocouples)
}

pub fn bench_with_digitizer(
    adjust: impl FnOnce(&mut RigConfig),
    digitizer: Arc<dyn ThermocoupleBackend>,
    thermocouples: SimulatedThermocouples,
) -> Bench {
    let results = tempfile::tempdir().unwrap();
    let mut config = config(results.path());
    adjust(&mut config);

    let supply = SimulatedSupply::new(config.experiment.load_resistance_ohm);
    let gpio = SimulatedGpio::new();
    let relays = RelayBank::new(
        Arc::new(gpio.clone()),
        config.relays.pins.clone(),
        config.relays.active_low,
    )
    .unwrap();

    let rig = Rig::with_parts(config, Arc::new(supply.connector()), digitizer, relays);
    Bench {
        rig: Arc::new(rig),
        supply,
        thermocouples,
        gpio,
        results,
    }
}

/// Request over `levels` with a 10 Ω heater, 2 s per level, 1 s cadence, pump on.
pub fn request(levels: &[f64]) -> RunRequest {
    RunRequest {
        power_levels: levels.to_vec(),
        duration_per_level_s: 2.0,
        sample_interval_s: 1.0,
        load_resistance_ohm: 10.0,
        pump_enabled: true,
    }
}

/// Header and data rows of a result file.
pub fn read_csv(path: &Path) -> (csv::StringRecord, Vec<csv::StringRecord>) {
    let mut reader = csv::Reader::from_path(path).unwrap();
    let header = reader.headers().unwrap().clone();
    let rows = reader.records().map(|r| r.unwrap()).collect();
    (header, rows)
}

/// Index of a named column.
pub fn column(header: &csv::StringRecord, name: &str) -> usize {
    header
        .iter()
        .position(|h| h == name)
        .unwrap_or_else(|| panic!("no column {}", name))
}
