//! ---
//! vsub_section: "02-test-orchestration"
//! vsub_subsection: "module"
//! vsub_type: "source"
//! vsub_scope: "code"
//! vsub_description: "Single-writer state mirror of the simulated setpoints."
//! vsub_version: "v0.1.0"
//! vsub_owner: "tbd"
//! ---
//! The state mirror holds the coordinator's view of the setpoints it feeds to
//! the device-under-test. One task owns the state; every mutation is queued
//! through [`MirrorHandle::dispatch`] and acknowledged with the resulting
//! snapshot, so concurrent writers are serialised by construction.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use vsub_common::MirrorConfig;
use vsub_metrics::HarnessMetrics;

use crate::error::{CommandError, MirrorError};

pub const NOMINAL_VOLTAGE: f64 = 132.0;
pub const NOMINAL_CURRENT: f64 = 450.0;
pub const NOMINAL_FREQUENCY: f64 = 50.0;

/// Electrical quantities commanded by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Setpoint {
    pub voltage: f64,
    pub current: f64,
    pub frequency: f64,
    pub fault_current: f64,
}

/// Everything the mirror holds. Served verbatim to the device-under-test,
/// which polls it as its simulation input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationStatus {
    pub voltage: f64,
    pub current: f64,
    pub frequency: f64,
    pub fault_current: f64,
    pub fault_detected: bool,
    pub trip_command: bool,
    /// `true` means open.
    pub breaker_status: bool,
}

impl SimulationStatus {
    /// Nominal operating point: no fault, no trip, breaker closed.
    pub fn baseline() -> Self {
        Self {
            voltage: NOMINAL_VOLTAGE,
            current: NOMINAL_CURRENT,
            frequency: NOMINAL_FREQUENCY,
            fault_current: 0.0,
            fault_detected: false,
            trip_command: false,
            breaker_status: false,
        }
    }

    pub fn setpoint(&self) -> Setpoint {
        Setpoint {
            voltage: self.voltage,
            current: self.current,
            frequency: self.frequency,
            fault_current: self.fault_current,
        }
    }
}

impl Default for SimulationStatus {
    fn default() -> Self {
        Self::baseline()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetpointField {
    Voltage,
    Current,
    Frequency,
    FaultCurrent,
}

impl SetpointField {
    fn wire_key(self) -> &'static str {
        match self {
            SetpointField::Voltage => "voltage",
            SetpointField::Current => "current",
            SetpointField::Frequency => "frequency",
            SetpointField::FaultCurrent => "faultCurrent",
        }
    }
}

/// Mutations accepted by the mirror.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MirrorCommand {
    Set(SetpointField, f64),
    ToggleFault(bool),
    /// `true` opens the breaker.
    ToggleBreaker(bool),
    /// Opens the breaker and raises the trip flag; both clear automatically
    /// after the configured delay.
    SendTrip,
    /// Clears fault and trip flags and restores nominal current.
    ResetTrip,
    ToggleManualTrip(bool),
    Normalize,
}

impl MirrorCommand {
    /// Metric and log label.
    pub fn name(&self) -> &'static str {
        match self {
            MirrorCommand::Set(SetpointField::Voltage, _) => "set_voltage",
            MirrorCommand::Set(SetpointField::Current, _) => "set_current",
            MirrorCommand::Set(SetpointField::Frequency, _) => "set_frequency",
            MirrorCommand::Set(SetpointField::FaultCurrent, _) => "set_fault_current",
            MirrorCommand::ToggleFault(_) => "toggle_fault",
            MirrorCommand::ToggleBreaker(_) => "toggle_breaker",
            MirrorCommand::SendTrip => "send_trip",
            MirrorCommand::ResetTrip => "reset_trip",
            MirrorCommand::ToggleManualTrip(_) => "toggle_manual_trip",
            MirrorCommand::Normalize => "normalize",
        }
    }

    /// Parse the `{command, data}` vocabulary used by the control panels.
    pub fn from_wire(command: &str, data: &Value) -> Result<Self, CommandError> {
        let parsed = match command {
            "updateVoltage" => MirrorCommand::Set(
                SetpointField::Voltage,
                number_field(data, SetpointField::Voltage.wire_key())?,
            ),
            "updateCurrent" => MirrorCommand::Set(
                SetpointField::Current,
                number_field(data, SetpointField::Current.wire_key())?,
            ),
            "updateFrequency" => MirrorCommand::Set(
                SetpointField::Frequency,
                number_field(data, SetpointField::Frequency.wire_key())?,
            ),
            "updateFaultCurrent" => MirrorCommand::Set(
                SetpointField::FaultCurrent,
                number_field(data, SetpointField::FaultCurrent.wire_key())?,
            ),
            "toggleFault" => MirrorCommand::ToggleFault(bool_field(data, "active")?),
            "toggleBreaker" => MirrorCommand::ToggleBreaker(bool_field(data, "open")?),
            "sendTrip" => MirrorCommand::SendTrip,
            "resetTrip" => MirrorCommand::ResetTrip,
            "toggleManualTrip" => MirrorCommand::ToggleManualTrip(bool_field(data, "active")?),
            other => return Err(CommandError::UnknownCommand(other.to_owned())),
        };
        Ok(parsed)
    }
}

impl fmt::Display for MirrorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorCommand::Set(_, value) => write!(f, "{}={}", self.name(), value),
            MirrorCommand::ToggleFault(flag)
            | MirrorCommand::ToggleBreaker(flag)
            | MirrorCommand::ToggleManualTrip(flag) => write!(f, "{}={}", self.name(), flag),
            _ => f.write_str(self.name()),
        }
    }
}

fn number_field(data: &Value, key: &str) -> Result<f64, CommandError> {
    data.get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| CommandError::InvalidPayload(format!("expected numeric field '{key}'")))
}

fn bool_field(data: &Value, key: &str) -> Result<bool, CommandError> {
    data.get(key)
        .and_then(Value::as_bool)
        .ok_or_else(|| CommandError::InvalidPayload(format!("expected boolean field '{key}'")))
}

enum MirrorMessage {
    Dispatch {
        command: MirrorCommand,
        reply: oneshot::Sender<SimulationStatus>,
    },
    ClearManualTrip {
        generation: u64,
    },
}

/// Cloneable handle to the mirror task.
#[derive(Debug, Clone)]
pub struct MirrorHandle {
    tx: mpsc::Sender<MirrorMessage>,
    state: watch::Receiver<SimulationStatus>,
}

impl fmt::Debug for MirrorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorMessage::Dispatch { command, .. } => {
                f.debug_struct("Dispatch").field("command", command).finish()
            }
            MirrorMessage::ClearManualTrip { generation } => f
                .debug_struct("ClearManualTrip")
                .field("generation", generation)
                .finish(),
        }
    }
}

impl MirrorHandle {
    /// Spawn the mirror task starting from the baseline status. The task
    /// stops once every handle has been dropped.
    pub fn spawn(config: &MirrorConfig, metrics: Option<HarnessMetrics>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(SimulationStatus::baseline());
        let actor = MirrorActor {
            status: SimulationStatus::baseline(),
            state_tx,
            loopback: tx.downgrade(),
            clear_after: config.manual_trip_clear_after,
            trip_generation: 0,
            pending_clear: None,
            metrics,
        };
        let task = tokio::spawn(actor.run(rx));
        (
            Self {
                tx,
                state: state_rx,
            },
            task,
        )
    }

    /// Queue a mutation and wait for it to be applied.
    pub async fn dispatch(&self, command: MirrorCommand) -> Result<SimulationStatus, MirrorError> {
        let (reply, applied) = oneshot::channel();
        self.tx
            .send(MirrorMessage::Dispatch { command, reply })
            .await
            .map_err(|_| MirrorError::Closed)?;
        applied.await.map_err(|_| MirrorError::Closed)
    }

    /// Overwrite one setpoint field.
    pub async fn set(&self, field: SetpointField, value: f64) -> Result<SimulationStatus, MirrorError> {
        self.dispatch(MirrorCommand::Set(field, value)).await
    }

    /// Latest applied status.
    pub fn snapshot(&self) -> SimulationStatus {
        *self.state.borrow()
    }

    /// Receiver notified after every applied mutation.
    pub fn subscribe(&self) -> watch::Receiver<SimulationStatus> {
        self.state.clone()
    }
}

struct MirrorActor {
    status: SimulationStatus,
    state_tx: watch::Sender<SimulationStatus>,
    loopback: mpsc::WeakSender<MirrorMessage>,
    clear_after: Duration,
    trip_generation: u64,
    pending_clear: Option<JoinHandle<()>>,
    metrics: Option<HarnessMetrics>,
}

impl MirrorActor {
    async fn run(mut self, mut rx: mpsc::Receiver<MirrorMessage>) {
        while let Some(message) = rx.recv().await {
            match message {
                MirrorMessage::Dispatch { command, reply } => {
                    self.apply(command);
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_command(command.name());
                    }
                    debug!(command = %command, status = ?self.status, "mirror command applied");
                    self.publish();
                    let _ = reply.send(self.status);
                }
                MirrorMessage::ClearManualTrip { generation } => {
                    if generation != self.trip_generation {
                        continue;
                    }
                    self.pending_clear = None;
                    self.status.trip_command = false;
                    self.status.breaker_status = false;
                    info!(generation, "manual trip auto-cleared");
                    self.publish();
                }
            }
        }
        self.cancel_pending_clear();
        debug!("state mirror stopped");
    }

    fn apply(&mut self, command: MirrorCommand) {
        let status = &mut self.status;
        match command {
            MirrorCommand::Set(SetpointField::Voltage, value) => status.voltage = value,
            MirrorCommand::Set(SetpointField::Current, value) => status.current = value,
            MirrorCommand::Set(SetpointField::Frequency, value) => status.frequency = value,
            MirrorCommand::Set(SetpointField::FaultCurrent, value) => status.fault_current = value,
            MirrorCommand::ToggleFault(active) => status.fault_detected = active,
            MirrorCommand::ToggleBreaker(open) => status.breaker_status = open,
            MirrorCommand::SendTrip => {
                status.trip_command = true;
                status.breaker_status = true;
                self.schedule_clear();
            }
            MirrorCommand::ResetTrip => {
                status.trip_command = false;
                status.fault_detected = false;
                status.current = NOMINAL_CURRENT;
                status.fault_current = 0.0;
                self.cancel_pending_clear();
            }
            MirrorCommand::ToggleManualTrip(active) => status.trip_command = active,
            MirrorCommand::Normalize => {
                *status = SimulationStatus::baseline();
                self.cancel_pending_clear();
            }
        }
    }

    fn schedule_clear(&mut self) {
        self.cancel_pending_clear();
        let generation = self.trip_generation;
        let delay = self.clear_after;
        let loopback = self.loopback.clone();
        self.pending_clear = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = loopback.upgrade() {
                let _ = tx.send(MirrorMessage::ClearManualTrip { generation }).await;
            }
        }));
    }

    /// Abort any scheduled clear and invalidate one that is already queued.
    fn cancel_pending_clear(&mut self) {
        self.trip_generation = self.trip_generation.wrapping_add(1);
        if let Some(task) = self.pending_clear.take() {
            task.abort();
        }
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.status);
    }
}
