//! Run requests and run records.

use crate::config::ExperimentConfig;
use crate::error::{RigError, RigResult};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Parameters of one experiment run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Power sequence (W)
    pub power_levels: Vec<f64>,
    /// Sampling time per level (s)
    pub duration_per_level_s: f64,
    /// Sampling cadence (s)
    pub sample_interval_s: f64,
    /// Heater resistance (Ω)
    pub load_resistance_ohm: f64,
    /// Run the coolant pump
    pub pump_enabled: bool,
}

impl RunRequest {
    /// Request built from the configured defaults.
    pub fn from_config(config: &ExperimentConfig) -> Self {
        Self {
            power_levels: config.power_levels.clone(),
            duration_per_level_s: config.duration_per_level_s,
            sample_interval_s: config.sample_interval_s,
            load_resistance_ohm: config.load_resistance_ohm,
            pump_enabled: config.pump_enabled,
        }
    }

    /// Reject malformed requests before anything is started.
    pub fn validate(&self) -> RigResult<()> {
        let invalid = |msg: String| Err(RigError::InvalidRequest(msg));

        if self.power_levels.is_empty() {
            return invalid("at least one power level is required".into());
        }
        if let Some(bad) = self
            .power_levels
            .iter()
            .find(|p| !(p.is_finite() && **p >= 0.0))
        {
            return invalid(format!("power level {} W is not a finite, non-negative number", bad));
        }
        for (name, value) in [
            ("duration_per_level_s", self.duration_per_level_s),
            ("sample_interval_s", self.sample_interval_s),
            ("load_resistance_ohm", self.load_resistance_ohm),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return invalid(format!("{} must be positive, got {}", name, value));
            }
        }
        for (name, value) in [
            ("duration_per_level_s", self.duration_per_level_s),
            ("sample_interval_s", self.sample_interval_s),
        ] {
            if !Duration::try_from_secs_f64(value).map_or(false, |d| !d.is_zero()) {
                return invalid(format!("{} of {} s is not a representable duration", name, value));
            }
        }
        Ok(())
    }

    /// Sampling window per level.
    pub fn duration_per_level(&self) -> Duration {
        Duration::from_secs_f64(self.duration_per_level_s)
    }

    /// Sampling cadence.
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs_f64(self.sample_interval_s)
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Worker is executing the run
    Running,
    /// Every level was processed
    Completed,
    /// Stopped on request
    Interrupted,
    /// Aborted by a fatal error
    Error,
}

impl RunStatus {
    /// Whether the run has ended.
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Interrupted => "interrupted",
            RunStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// How a power level ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelOutcome {
    /// Sampled for the full window
    Completed,
    /// Not sampled (limits exceeded or the supply rejected the setpoint)
    Skipped,
    /// Ended early by a protection trip or a failed protection poll
    ProtectionTrip,
    /// Ended by a stop request or a fatal error
    Interrupted,
}

/// Per-level record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelSummary {
    /// Target power (W)
    pub power_w: f64,
    /// Computed voltage setpoint (V)
    pub voltage_v: f64,
    /// Computed operating current (A)
    pub current_a: f64,
    /// Rows written for this level
    pub samples: usize,
    /// How the level ended
    pub outcome: LevelOutcome,
}

/// One experiment run, as reported to status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRun {
    /// `thermal_experiment_<timestamp>`
    pub id: String,
    /// Power sequence (W)
    pub power_levels: Vec<f64>,
    /// Sampling time per level (s)
    pub duration_per_level_s: f64,
    /// Sampling cadence (s)
    pub sample_interval_s: f64,
    /// Heater resistance (Ω)
    pub load_resistance_ohm: f64,
    /// Pump used
    pub pump_enabled: bool,
    /// Lifecycle state
    pub status: RunStatus,
    /// Rows written
    pub samples_collected: usize,
    /// Level and run errors, in order of occurrence
    pub errors: Vec<String>,
    /// Result file
    pub output_path: PathBuf,
    /// Start time
    pub started_at: DateTime<Local>,
    /// End time, once terminal
    pub finished_at: Option<DateTime<Local>>,
    /// Wall time of the run, once terminal (s)
    pub total_elapsed_s: Option<f64>,
    /// One entry per level attempted
    pub levels: Vec<LevelSummary>,
}

/// Run id derived from the start time.
pub fn run_id(started_at: &DateTime<Local>) -> String {
    format!("thermal_experiment_{}", started_at.format("%Y%m%d_%H%M%S_%3f"))
}

impl ExperimentRun {
    /// New `Running` record writing to `<results_dir>/<id>.csv`.
    pub fn new(request: &RunRequest, results_dir: &Path) -> Self {
        let started_at = Local::now();
        let id = run_id(&started_at);
        let output_path = results_dir.join(format!("{}.csv", id));
        Self {
            id,
            power_levels: request.power_levels.clone(),
            duration_per_level_s: request.duration_per_level_s,
            sample_interval_s: request.sample_interval_s,
            load_resistance_ohm: request.load_resistance_ohm,
            pump_enabled: request.pump_enabled,
            status: RunStatus::Running,
            samples_collected: 0,
            errors: Vec::new(),
            output_path,
            started_at,
            finished_at: None,
            total_elapsed_s: None,
            levels: Vec::new(),
        }
    }

    /// Whether the run is still executing.
    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }

    /// Enter a terminal state. Has no effect once terminal.
    pub fn finish(&mut self, status: RunStatus, elapsed: Duration) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.finished_at = Some(Local::now());
        self.total_elapsed_s = Some(elapsed.as_secs_f64());
    }
}

/// Answer to a status query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    /// A run is active
    pub running: bool,
    /// The active run, or the last one
    pub run: Option<ExperimentRun>,
}
