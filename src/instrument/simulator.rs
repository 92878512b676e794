//! In-process simulated power supply.
//!
//! [`SimulatedSupply`] speaks the same SCPI grammar as the real instrument over an
//! in-memory duplex stream, so the link and driver run unmodified against it. Every
//! connection gets its own device task; all connections share one instrument state.
//!
//! The load is a plain resistor: with output on, `V = min(Vset, Iset·R)` and `I = V/R`.
//!
//! Faults can be injected at any time for tests:
//! - protection bits reported on a chosen status poll ([`SimulatedSupply::trip_on_poll`])
//! - a readback offset that defeats write-then-verify
//! - refusing connections, dropping the stream after N commands, going silent
//! - a garbled protection-status reply or garbled measurements
//! - a current rating below the requested setpoint
//!
//! The command log keeps the most recent [`COMMAND_LOG_LIMIT`] lines.

use crate::error::{RigError, RigResult};
use crate::instrument::link::{Connector, DynStream};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tracing::debug;

const IDN: &str = "B&K Precision,XLN30052,SIM0000001,1.0-sim";

/// Commands retained by the log; older ones are discarded.
pub const COMMAND_LOG_LIMIT: usize = 4096;

#[derive(Debug, Default)]
struct Faults {
    trip: Option<(u32, u32)>,
    voltage_offset: f64,
    current_offset: f64,
    refuse_connections: bool,
    drop_after: Option<usize>,
    silent: bool,
    garble_status: bool,
    garble_measurements: bool,
    current_rating: Option<f64>,
}

#[derive(Debug)]
struct SupplyState {
    load_ohm: f64,
    voltage_set: f64,
    current_set: f64,
    output_on: bool,
    status_polls: u32,
    connections: usize,
    received: usize,
    commands: VecDeque<String>,
    faults: Faults,
}

/// What the device does with one received line.
enum Action {
    Reply(String),
    Nothing,
    Hangup,
}

/// Shared state of a simulated XLN-series supply.
#[derive(Debug, Clone)]
pub struct SimulatedSupply {
    state: Arc<Mutex<SupplyState>>,
}

impl SimulatedSupply {
    /// Supply driving a resistive load of `load_ohm`.
    pub fn new(load_ohm: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(SupplyState {
                load_ohm,
                voltage_set: 0.0,
                current_set: 0.0,
                output_on: false,
                status_polls: 0,
                connections: 0,
                received: 0,
                commands: VecDeque::new(),
                faults: Faults::default(),
            })),
        }
    }

    /// Connector handing out sessions to this supply.
    pub fn connector(&self) -> SimulatedConnector {
        SimulatedConnector {
            supply: self.clone(),
        }
    }

    /// Report `bits` from `STAT:QUES:COND?` on the `poll`-th status poll (1-based).
    /// Every other poll reports 0.
    pub fn trip_on_poll(&self, poll: u32, bits: u32) {
        self.state.lock().faults.trip = Some((poll, bits));
    }

    /// Add offsets to the `VOLT?` and `CURR?` readbacks.
    pub fn set_readback_offset(&self, volts: f64, amps: f64) {
        let mut state = self.state.lock();
        state.faults.voltage_offset = volts;
        state.faults.current_offset = amps;
    }

    /// Refuse new connections.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().faults.refuse_connections = refuse;
    }

    /// Hang up, without replying, when the `n`-th command from now arrives. One-shot.
    pub fn drop_after(&self, n: usize) {
        let mut state = self.state.lock();
        state.faults.drop_after = Some(state.received + n);
    }

    /// Stop answering queries.
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().faults.silent = silent;
    }

    /// Answer `STAT:QUES:COND?` with a non-numeric token.
    pub fn garble_status(&self, garble: bool) {
        self.state.lock().faults.garble_status = garble;
    }

    /// Answer `MEAS:VOLT?` and `MEAS:CURR?` with a non-numeric token.
    pub fn garble_measurements(&self, garble: bool) {
        self.state.lock().faults.garble_measurements = garble;
    }

    /// Clamp programmed current to `amps`, as a lower-rated supply would.
    pub fn limit_current(&self, amps: f64) {
        self.state.lock().faults.current_rating = Some(amps);
    }

    /// Recent command lines, oldest first.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.iter().cloned().collect()
    }

    /// Forget the command log.
    pub fn clear_commands(&self) {
        self.state.lock().commands.clear();
    }

    /// Number of sessions opened.
    pub fn connections(&self) -> usize {
        self.state.lock().connections
    }

    /// Whether the output is enabled.
    pub fn output_enabled(&self) -> bool {
        self.state.lock().output_on
    }

    /// Programmed (voltage, current).
    pub fn setpoints(&self) -> (f64, f64) {
        let state = self.state.lock();
        (state.voltage_set, state.current_set)
    }

    fn handle(&self, line: &str) -> Action {
        let mut state = self.state.lock();
        state.received += 1;
        if state.commands.len() == COMMAND_LOG_LIMIT {
            state.commands.pop_front();
        }
        state.commands.push_back(line.to_string());

        if state.faults.drop_after == Some(state.received) {
            state.faults.drop_after = None;
            return Action::Hangup;
        }

        let (header, argument) = match line.split_once(' ') {
            Some((header, arg)) => (header.to_ascii_uppercase(), Some(arg.trim())),
            None => (line.to_ascii_uppercase(), None),
        };
        let is_query = header.ends_with('?');
        if is_query && state.faults.silent {
            return Action::Nothing;
        }

        let reply = match (header.as_str(), argument) {
            ("VOLT", Some(arg)) => {
                if let Ok(v) = arg.parse::<f64>() {
                    state.voltage_set = v;
                }
                None
            }
            ("CURR", Some(arg)) => {
                if let Ok(i) = arg.parse::<f64>() {
                    state.current_set = match state.faults.current_rating {
                        Some(rating) => i.min(rating),
                        None => i,
                    };
                }
                None
            }
            ("OUTP", Some(arg)) => {
                match arg.to_ascii_uppercase().as_str() {
                    "ON" | "1" => state.output_on = true,
                    "OFF" | "0" => state.output_on = false,
                    _ => {}
                }
                None
            }
            ("VOLT?", _) => Some(format!("{:.3}", state.voltage_set + state.faults.voltage_offset)),
            ("CURR?", _) => Some(format!("{:.4}", state.current_set + state.faults.current_offset)),
            ("MEAS:VOLT?" | "MEAS:CURR?", _) if state.faults.garble_measurements => {
                Some("ERR".to_string())
            }
            ("MEAS:VOLT?", _) => Some(format!("{:.3}", state.output().0)),
            ("MEAS:CURR?", _) => Some(format!("{:.4}", state.output().1)),
            ("OUTP?", _) => Some(if state.output_on { "1" } else { "0" }.to_string()),
            ("STAT:QUES:COND?", _) => {
                state.status_polls += 1;
                if state.faults.garble_status {
                    Some("ERR".to_string())
                } else {
                    let bits = match state.faults.trip {
                        Some((poll, bits)) if poll == state.status_polls => bits,
                        _ => 0,
                    };
                    Some(bits.to_string())
                }
            }
            ("*CLS", _) => None,
            ("*IDN?", _) => Some(IDN.to_string()),
            _ if is_query => Some("ERR".to_string()),
            _ => None,
        };

        match reply {
            Some(text) => Action::Reply(text),
            None => Action::Nothing,
        }
    }
}

impl SupplyState {
    fn output(&self) -> (f64, f64) {
        if !self.output_on || self.load_ohm <= 0.0 {
            return (0.0, 0.0);
        }
        let voltage = self.voltage_set.min(self.current_set * self.load_ohm);
        (voltage, voltage / self.load_ohm)
    }
}

async fn serve(supply: SimulatedSupply, device: DuplexStream) {
    let mut device = BufReader::new(device);
    let mut line = String::new();
    loop {
        line.clear();
        match device.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        match supply.handle(command) {
            Action::Reply(text) => {
                let framed = format!("{}\n", text);
                if device.get_mut().write_all(framed.as_bytes()).await.is_err() {
                    break;
                }
            }
            Action::Nothing => {}
            Action::Hangup => {
                debug!("Simulated supply hanging up");
                break;
            }
        }
    }
}

/// [`Connector`] for a [`SimulatedSupply`].
#[derive(Debug, Clone)]
pub struct SimulatedConnector {
    supply: SimulatedSupply,
}

#[async_trait]
impl Connector for SimulatedConnector {
    async fn connect(&self) -> RigResult<DynStream> {
        {
            let mut state = self.supply.state.lock();
            if state.faults.refuse_connections {
                return Err(RigError::Connect {
                    target: self.target(),
                    reason: "connection refused".into(),
                });
            }
            state.connections += 1;
        }
        let (host, device) = tokio::io::duplex(1024);
        tokio::spawn(serve(self.supply.clone(), device));
        Ok(Box::new(host))
    }

    fn target(&self) -> String {
        "simulated XLN30052".to_string()
    }
}
