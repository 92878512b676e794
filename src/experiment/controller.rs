//! Single-flight experiment launcher.
//!
//! [`ExperimentController`] is the only way to start a run. It owns the
//! "a run is active" flag: the flag is claimed atomically before a worker is spawned and
//! released by a guard when the worker finishes, however it finishes. Status queries
//! read the last published run record and never wait on the worker.

use crate::error::{RigError, RigResult};
use crate::experiment::orchestrator::ThermalExperiment;
use crate::experiment::run::{ExperimentRun, RunRequest, RunStatus, StatusReport};
use crate::experiment::scheduler::{StopHandle, StopSignal};
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Releases the running flag on drop, including during unwinding.
struct RunningGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Launches runs on a worker task and answers status queries.
pub struct ExperimentController {
    experiment: Arc<ThermalExperiment>,
    running: Arc<AtomicBool>,
    status_tx: Arc<watch::Sender<Option<ExperimentRun>>>,
    status_rx: watch::Receiver<Option<ExperimentRun>>,
    stop: Mutex<Option<StopHandle>>,
    worker: Mutex<Option<JoinHandle<ExperimentRun>>>,
}

impl ExperimentController {
    /// Controller with no run history.
    pub fn new(experiment: Arc<ThermalExperiment>) -> Self {
        let (status_tx, status_rx) = watch::channel(None);
        Self {
            experiment,
            running: Arc::new(AtomicBool::new(false)),
            status_tx: Arc::new(status_tx),
            status_rx,
            stop: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Validate `request` and launch it on a worker task.
    ///
    /// Rejected with [`RigError::RunAlreadyActive`] while another run is active.
    /// Must be called from within a tokio runtime.
    pub fn start_run(&self, request: RunRequest) -> RigResult<ExperimentRun> {
        request.validate()?;

        // Held across claim, install and spawn so `stop` never sees the flag without
        // this run's handle
        let mut stop_slot = self.stop.lock();
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let active = self
                .status_rx
                .borrow()
                .as_ref()
                .map(|run| run.id.clone())
                .unwrap_or_else(|| "starting".to_string());
            warn!(%active, "Run rejected, another run is active");
            return Err(RigError::RunAlreadyActive(active));
        }
        let guard = RunningGuard {
            flag: Arc::clone(&self.running),
        };

        let run = self.experiment.prepare(&request);
        self.status_tx.send_replace(Some(run.clone()));
        info!(run = %run.id, "Run accepted");

        let (stop_handle, stop_signal) = StopSignal::pair();
        let experiment = Arc::clone(&self.experiment);
        let status_tx = Arc::clone(&self.status_tx);
        let initial = run.clone();
        let fallback = run.clone();

        let worker = tokio::spawn(async move {
            // Declared first so the flag is released last
            let _guard = guard;
            let started = Instant::now();
            let pump_enabled = request.pump_enabled;

            let outcome = AssertUnwindSafe(experiment.execute(initial, request, stop_signal, &status_tx))
                .catch_unwind()
                .await;

            let finished = match outcome {
                Ok(run) => run,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(%message, "Experiment worker panicked");
                    let mut run = status_tx.borrow().clone().unwrap_or(fallback);
                    run.errors.push(RigError::Worker(message).to_string());
                    let cleanup_errors = experiment.make_safe(pump_enabled).await;
                    run.errors.extend(cleanup_errors);
                    run.finish(RunStatus::Error, started.elapsed());
                    run
                }
            };
            status_tx.send_replace(Some(finished.clone()));
            finished
        });

        *stop_slot = Some(stop_handle);
        *self.worker.lock() = Some(worker);
        drop(stop_slot);
        Ok(run)
    }

    /// Whether a run is active, with the active or last run record.
    pub fn get_status(&self) -> StatusReport {
        StatusReport {
            running: self.running.load(Ordering::Acquire),
            run: self.status_rx.borrow().clone(),
        }
    }

    /// Request the active run to stop. Returns whether a run was active.
    pub fn stop(&self) -> bool {
        let slot = self.stop.lock();
        let active = self.running.load(Ordering::Acquire);
        if let (true, Some(handle)) = (active, slot.as_ref()) {
            info!("Stop requested");
            handle.stop();
        }
        active
    }

    /// Wait for the current worker to finish and return its final record.
    ///
    /// `Ok(None)` when no worker has been started or it was already awaited.
    pub async fn wait(&self) -> RigResult<Option<ExperimentRun>> {
        let worker = self.worker.lock().take();
        match worker {
            Some(handle) => handle
                .await
                .map(Some)
                .map_err(|e| RigError::Worker(e.to_string())),
            None => Ok(None),
        }
    }

    /// Subscribe to run record updates.
    pub fn subscribe(&self) -> watch::Receiver<Option<ExperimentRun>> {
        self.status_tx.subscribe()
    }
}

impl std::fmt::Debug for ExperimentController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentController")
            .field("running", &self.running.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_readable() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }

    #[test]
    fn guard_releases_flag() {
        let flag = Arc::new(AtomicBool::new(true));
        {
            let _guard = RunningGuard {
                flag: Arc::clone(&flag),
            };
        }
        assert!(!flag.load(Ordering::Acquire));
    }
}
