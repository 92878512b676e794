//! Rig assembly.
//!
//! [`Rig`] builds every resource from a [`RigConfig`], picking the real or simulated
//! backend per section, and wires them into one [`ExperimentController`]. Resources
//! are shared (`Arc`) between the controller and direct callers such as the CLI.

use crate::acquisition::{
    MccBackend, SimulatedThermocouples, TemperatureAcquisition, ThermocoupleBackend,
};
use crate::actuator::RelayBank;
use crate::config::{DigitizerBackend, InstrumentBackend, RigConfig};
use crate::error::RigResult;
use crate::experiment::{ExperimentController, ExperimentSettings, ThermalExperiment};
use crate::instrument::{Connector, PowerSupply, SimulatedSupply, TcpConnector};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Every resource of the rig plus the run controller.
#[derive(Debug)]
pub struct Rig {
    config: RigConfig,
    supply: Arc<PowerSupply>,
    thermocouples: Arc<TemperatureAcquisition>,
    relays: Arc<RelayBank>,
    experiment: Arc<ThermalExperiment>,
    controller: ExperimentController,
}

impl Rig {
    /// Validate `config` and build the rig from it.
    pub fn from_config(config: RigConfig) -> RigResult<Self> {
        config.validate()?;

        let inst = &config.instrument;
        let connector: Arc<dyn Connector> = match inst.backend {
            InstrumentBackend::Tcp => Arc::new(TcpConnector::new(
                inst.host.clone(),
                inst.port,
                inst.timeout(),
                Duration::from_millis(inst.connect_settle_ms),
            )),
            InstrumentBackend::Simulated => {
                warn!("Power supply runs in simulation mode");
                Arc::new(SimulatedSupply::new(config.experiment.load_resistance_ohm).connector())
            }
        };

        let digitizer: Arc<dyn ThermocoupleBackend> = match config.digitizer.backend {
            DigitizerBackend::Mcc => Arc::new(MccBackend::from_config(&config.digitizer)),
            DigitizerBackend::Simulated => {
                warn!("Thermocouples run in simulation mode");
                Arc::new(SimulatedThermocouples::new())
            }
        };

        let relays = RelayBank::from_config(&config.relays)?;
        Ok(Self::with_parts(config, connector, digitizer, relays))
    }

    /// Assemble a rig from explicit backends. `config` supplies limits and settings.
    pub fn with_parts(
        config: RigConfig,
        connector: Arc<dyn Connector>,
        digitizer: Arc<dyn ThermocoupleBackend>,
        relays: RelayBank,
    ) -> Self {
        let supply = Arc::new(PowerSupply::from_config(&config.instrument, connector));
        let thermocouples = Arc::new(TemperatureAcquisition::from_config(
            &config.digitizer,
            digitizer,
        ));
        let relays = Arc::new(relays);
        let experiment = Arc::new(ThermalExperiment::new(
            Arc::clone(&supply),
            Arc::clone(&thermocouples),
            Arc::clone(&relays),
            ExperimentSettings::from_config(&config),
        ));
        let controller = ExperimentController::new(Arc::clone(&experiment));
        info!(
            supply = ?config.instrument.backend,
            digitizer = ?config.digitizer.backend,
            relays = ?config.relays.backend,
            "Rig assembled"
        );
        Self {
            config,
            supply,
            thermocouples,
            relays,
            experiment,
            controller,
        }
    }

    /// Effective configuration.
    pub fn config(&self) -> &RigConfig {
        &self.config
    }

    /// Power supply driver.
    pub fn supply(&self) -> &Arc<PowerSupply> {
        &self.supply
    }

    /// Thermocouple acquisition.
    pub fn thermocouples(&self) -> &Arc<TemperatureAcquisition> {
        &self.thermocouples
    }

    /// Relay bank.
    pub fn relays(&self) -> &Arc<RelayBank> {
        &self.relays
    }

    /// Experiment procedure.
    pub fn experiment(&self) -> &Arc<ThermalExperiment> {
        &self.experiment
    }

    /// Run controller.
    pub fn controller(&self) -> &ExperimentController {
        &self.controller
    }

    /// Stop any active run, switch the output off, close the session and release the
    /// relays.
    pub async fn shutdown(&self) -> RigResult<()> {
        if self.controller.stop() {
            info!("Waiting for the active run to finish");
            if let Err(e) = self.controller.wait().await {
                warn!(error = %e, "Run worker did not finish cleanly");
            }
        }
        if self.supply.is_connected() {
            if let Err(e) = self.supply.output_off().await {
                warn!(error = %e, "Could not switch supply output off at shutdown");
            }
            self.supply.disconnect().await;
        }
        self.relays.shutdown()
    }
}
