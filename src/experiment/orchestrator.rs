//! Multi-level thermal characterization procedure.
//!
//! For each requested power level the procedure computes the supply operating point,
//! programs and enables the supply, samples on a fixed cadence until the level's window
//! closes, and switches the output off again. Faults are handled by scope:
//!
//! | Fault                               | Effect                                   |
//! |-------------------------------------|------------------------------------------|
//! | operating point beyond supply limits| level skipped, error recorded            |
//! | setpoint write/verify failure       | level skipped, error recorded            |
//! | failed measurement                  | value written as `N/A`, error recorded   |
//! | protection trip or failed poll      | level ends early, error recorded         |
//! | result file failure                 | run aborted with status `Error`          |
//! | stop request                        | run ends with status `Interrupted`       |
//!
//! Whatever the outcome, [`ThermalExperiment::make_safe`] switches the output off and
//! the pump relay off before the run record becomes final.

use crate::acquisition::TemperatureAcquisition;
use crate::actuator::RelayBank;
use crate::config::RigConfig;
use crate::error::RigError;
use crate::experiment::record::{ColumnLayout, RunLog, SampleRow};
use crate::experiment::run::{ExperimentRun, LevelOutcome, LevelSummary, RunRequest, RunStatus};
use crate::experiment::scheduler::{SampleClock, StopSignal, Stopped};
use crate::experiment::setpoint::{thermal_resistance, Setpoint};
use crate::instrument::PowerSupply;
use chrono::Local;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};

/// Why a run stopped before processing every level.
#[derive(Debug)]
enum Abort {
    Stopped,
    Fatal(RigError),
}

impl From<Stopped> for Abort {
    fn from(_: Stopped) -> Self {
        Abort::Stopped
    }
}

impl From<RigError> for Abort {
    fn from(e: RigError) -> Self {
        Abort::Fatal(e)
    }
}

/// Rig-level settings that are not part of a run request.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentSettings {
    /// Evaporator channel group
    pub evaporator_channels: Vec<u8>,
    /// Condenser channel group
    pub condenser_channels: Vec<u8>,
    /// Relay driving the pump
    pub pump_relay: String,
    /// Wait after the pump starts
    pub pump_settle: Duration,
    /// Wait after switching the output off between levels
    pub level_settle: Duration,
    /// Current limit margin over the operating current
    pub current_margin: f64,
    /// Directory receiving result files
    pub results_dir: PathBuf,
}

impl ExperimentSettings {
    /// Settings from the rig configuration.
    pub fn from_config(config: &RigConfig) -> Self {
        let exp = &config.experiment;
        Self {
            evaporator_channels: exp.evaporator_channels.clone(),
            condenser_channels: exp.condenser_channels.clone(),
            pump_relay: config.relays.pump.clone(),
            pump_settle: Duration::from_secs_f64(exp.pump_settle_s),
            level_settle: Duration::from_secs_f64(exp.level_settle_s),
            current_margin: exp.current_margin,
            results_dir: exp.results_dir.clone(),
        }
    }
}

/// The experiment procedure over a set of rig resources.
#[derive(Debug)]
pub struct ThermalExperiment {
    supply: Arc<PowerSupply>,
    thermocouples: Arc<TemperatureAcquisition>,
    relays: Arc<RelayBank>,
    settings: ExperimentSettings,
}

/// Mutable state of the run being executed.
struct RunContext<'a> {
    run: ExperimentRun,
    log: Option<RunLog>,
    started: Instant,
    progress: &'a watch::Sender<Option<ExperimentRun>>,
}

impl RunContext<'_> {
    fn record_error(&mut self, message: String) {
        warn!(run = %self.run.id, "{}", message);
        self.run.errors.push(message);
        self.publish();
    }

    fn publish(&self) {
        self.progress.send_replace(Some(self.run.clone()));
    }
}

impl ThermalExperiment {
    /// Procedure over the given resources.
    pub fn new(
        supply: Arc<PowerSupply>,
        thermocouples: Arc<TemperatureAcquisition>,
        relays: Arc<RelayBank>,
        settings: ExperimentSettings,
    ) -> Self {
        Self {
            supply,
            thermocouples,
            relays,
            settings,
        }
    }

    /// Rig-level settings.
    pub fn settings(&self) -> &ExperimentSettings {
        &self.settings
    }

    /// Result-file columns for this rig.
    pub fn layout(&self) -> ColumnLayout {
        ColumnLayout::new(
            self.thermocouples.channel_count(),
            &self.settings.evaporator_channels,
            &self.settings.condenser_channels,
        )
    }

    /// Fresh `Running` record for `request`.
    ///
    /// Runs started within the same millisecond get a numeric suffix so no result
    /// file is ever overwritten.
    pub fn prepare(&self, request: &RunRequest) -> ExperimentRun {
        let mut run = ExperimentRun::new(request, &self.settings.results_dir);
        let base = run.id.clone();
        let mut suffix = 1;
        while run.output_path.exists() {
            run.id = format!("{}_{}", base, suffix);
            run.output_path = self.settings.results_dir.join(format!("{}.csv", run.id));
            suffix += 1;
        }
        run
    }

    /// Execute a prepared run to a terminal state.
    ///
    /// Every intermediate state is published on `progress`; the returned record is
    /// final.
    pub async fn execute(
        &self,
        run: ExperimentRun,
        request: RunRequest,
        mut stop: StopSignal,
        progress: &watch::Sender<Option<ExperimentRun>>,
    ) -> ExperimentRun {
        let span = info_span!("experiment", run = %run.id);
        async move {
            info!(
                levels = ?request.power_levels,
                duration_s = request.duration_per_level_s,
                interval_s = request.sample_interval_s,
                resistance_ohm = request.load_resistance_ohm,
                "Starting experiment"
            );
            let mut ctx = RunContext {
                run,
                log: None,
                started: Instant::now(),
                progress,
            };
            ctx.publish();

            let status = match self.procedure(&mut ctx, &request, &mut stop).await {
                Ok(()) => RunStatus::Completed,
                Err(Abort::Stopped) => {
                    warn!("Experiment interrupted");
                    RunStatus::Interrupted
                }
                Err(Abort::Fatal(e)) => {
                    error!(error = %e, "Experiment aborted");
                    ctx.run.errors.push(e.to_string());
                    RunStatus::Error
                }
            };

            let cleanup_errors = self.make_safe(request.pump_enabled).await;
            ctx.run.errors.extend(cleanup_errors);
            ctx.run.finish(status, ctx.started.elapsed());
            ctx.publish();

            info!(
                status = %ctx.run.status,
                samples = ctx.run.samples_collected,
                errors = ctx.run.errors.len(),
                elapsed_s = ctx.run.total_elapsed_s,
                path = %ctx.run.output_path.display(),
                "Experiment finished"
            );
            ctx.run
        }
        .instrument(span)
        .await
    }

    /// Force the rig into its safe state: output off, pump off.
    ///
    /// Attempts every step; failures are logged and returned as messages.
    pub async fn make_safe(&self, pump_enabled: bool) -> Vec<String> {
        let mut failures = Vec::new();
        if let Err(e) = self.supply.output_off().await {
            error!(error = %e, "Could not switch supply output off");
            failures.push(format!("safe state: output off failed: {}", e));
        }
        if pump_enabled {
            match self.relays.deactivate(&self.settings.pump_relay) {
                Ok(()) => info!("Pump stopped"),
                Err(e) => {
                    error!(error = %e, "Could not stop pump");
                    failures.push(format!("safe state: pump off failed: {}", e));
                }
            }
        }
        failures
    }

    async fn procedure(
        &self,
        ctx: &mut RunContext<'_>,
        request: &RunRequest,
        stop: &mut StopSignal,
    ) -> Result<(), Abort> {
        ctx.log = Some(RunLog::create(&ctx.run.output_path, self.layout())?);

        if request.pump_enabled {
            self.relays.activate(&self.settings.pump_relay)?;
            info!(relay = %self.settings.pump_relay, "Pump started");
            stop.sleep(self.settings.pump_settle).await?;
        }

        ctx.started = Instant::now();
        let total = request.power_levels.len();
        for (index, power_w) in request.power_levels.iter().copied().enumerate() {
            stop.check()?;
            info!(level = index + 1, total, power_w, "Power level");
            self.run_level(ctx, request, power_w, stop).await?;
        }
        Ok(())
    }

    async fn run_level(
        &self,
        ctx: &mut RunContext<'_>,
        request: &RunRequest,
        power_w: f64,
        stop: &mut StopSignal,
    ) -> Result<(), Abort> {
        let setpoint = Setpoint::for_power(power_w, request.load_resistance_ohm);
        let mut summary = LevelSummary {
            power_w,
            voltage_v: setpoint.voltage,
            current_a: setpoint.current,
            samples: 0,
            outcome: LevelOutcome::Skipped,
        };

        if let Err(e) = setpoint.check_limits(self.supply.limits()) {
            ctx.record_error(format!("level {} W skipped: {}", power_w, e));
            ctx.run.levels.push(summary);
            return Ok(());
        }

        if let Err(e) = self.apply(&setpoint).await {
            ctx.record_error(format!("level {} W skipped: {}", power_w, e));
            if let Err(off) = self.supply.output_off().await {
                warn!(error = %off, "Output off after failed setup");
            }
            ctx.run.levels.push(summary);
            return Ok(());
        }

        let result = self.sample_level(ctx, request, &setpoint, &mut summary, stop).await;
        if result.is_err() {
            summary.outcome = LevelOutcome::Interrupted;
        }
        ctx.run.levels.push(summary);
        ctx.publish();
        result?;

        if let Err(e) = self.supply.output_off().await {
            ctx.record_error(format!("level {} W: output off failed: {}", power_w, e));
        }
        stop.sleep(self.settings.level_settle).await?;
        Ok(())
    }

    async fn apply(&self, setpoint: &Setpoint) -> Result<(), RigError> {
        let limits = self.supply.limits();
        self.supply.set_voltage(setpoint.voltage).await?;
        self.supply
            .set_current(setpoint.current_limit(self.settings.current_margin, limits.current_max))
            .await?;
        self.supply.output_on().await
    }

    async fn sample_level(
        &self,
        ctx: &mut RunContext<'_>,
        request: &RunRequest,
        setpoint: &Setpoint,
        summary: &mut LevelSummary,
        stop: &mut StopSignal,
    ) -> Result<(), Abort> {
        let power_w = setpoint.power_w;
        let mut clock = SampleClock::start(request.sample_interval(), request.duration_per_level());

        loop {
            let row = self.take_sample(ctx, power_w).await;
            if let Some(log) = ctx.log.as_mut() {
                log.append(&row)?;
            }
            ctx.run.samples_collected += 1;
            summary.samples += 1;
            ctx.publish();

            let protections = self.supply.check_protections().await;
            if !protections.is_ok() {
                ctx.record_error(format!(
                    "level {} W ended early: protection {}",
                    power_w, protections.summary
                ));
                summary.outcome = LevelOutcome::ProtectionTrip;
                return Ok(());
            }

            match clock.next_deadline() {
                Some(deadline) => stop.sleep_until(deadline).await?,
                None => break,
            }
        }

        info!(power_w, samples = summary.samples, "Level completed");
        summary.outcome = LevelOutcome::Completed;
        Ok(())
    }

    async fn take_sample(&self, ctx: &mut RunContext<'_>, power_w: f64) -> SampleRow {
        let voltage_v = match self.supply.measure_voltage().await {
            Ok(v) => Some(v),
            Err(e) => {
                ctx.record_error(format!("level {} W: voltage measurement failed: {}", power_w, e));
                None
            }
        };
        let current_a = match self.supply.measure_current().await {
            Ok(i) => Some(i),
            Err(e) => {
                ctx.record_error(format!("level {} W: current measurement failed: {}", power_w, e));
                None
            }
        };

        let temperatures = self.thermocouples.read_all().await;
        let evap_avg = temperatures.average(&self.settings.evaporator_channels);
        let cond_avg = temperatures.average(&self.settings.condenser_channels);
        let r_thermal = match (evap_avg, cond_avg) {
            (Some(evap), Some(cond)) => thermal_resistance(evap, cond, power_w),
            _ => None,
        };

        SampleRow {
            timestamp: Local::now(),
            elapsed_s: ctx.started.elapsed().as_secs_f64(),
            power_w,
            voltage_v,
            current_a,
            temperatures,
            evap_avg,
            cond_avg,
            r_thermal,
        }
    }
}
