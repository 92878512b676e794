//! Experiment orchestration: operating points, sample timing, result files, and the
//! single-flight run controller.

pub mod controller;
pub mod orchestrator;
pub mod record;
pub mod run;
pub mod scheduler;
pub mod setpoint;

pub use controller::ExperimentController;
pub use orchestrator::{ExperimentSettings, ThermalExperiment};
pub use record::{ChannelGroup, ColumnLayout, RunLog, SampleRow, MISSING};
pub use run::{
    ExperimentRun, LevelOutcome, LevelSummary, RunRequest, RunStatus, StatusReport,
};
pub use scheduler::{SampleClock, StopHandle, StopSignal, Stopped};
pub use setpoint::{thermal_resistance, Setpoint};
