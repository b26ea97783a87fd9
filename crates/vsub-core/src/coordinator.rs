//! ---
//! vsub_section: "03-coordination"
//! vsub_subsection: "module"
//! vsub_type: "source"
//! vsub_scope: "code"
//! vsub_description: "Owns the mirror, the device link and the run gate; fans out status frames."
//! vsub_version: "v0.1.0"
//! vsub_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use vsub_metrics::{HarnessMetrics, RunOutcome};

use crate::device::{DeviceLink, DeviceTelemetry, TelemetryRead};
use crate::error::{CommandError, RunError};
use crate::mirror::{MirrorCommand, MirrorHandle, SimulationStatus};
use crate::report::RunReport;
use crate::scenario::{BatteryPlan, RunPhase, ScenarioRunner};

/// Snapshot pushed to status subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusFrame {
    pub simulation: SimulationStatus,
    /// Last good device read; `None` until the device has answered once.
    pub device: Option<DeviceTelemetry>,
    pub run_phase: RunPhase,
}

/// Shared entry point used by the API surface and the CLI.
pub struct Coordinator {
    mirror: MirrorHandle,
    link: Arc<dyn DeviceLink>,
    runner: ScenarioRunner,
    run_gate: Mutex<()>,
    /// Shared by external commands, held exclusively for the length of a run.
    mirror_access: tokio::sync::RwLock<()>,
    running: AtomicBool,
    last_device: RwLock<Option<DeviceTelemetry>>,
    frames: broadcast::Sender<StatusFrame>,
    metrics: Option<HarnessMetrics>,
}

impl Coordinator {
    pub fn new(
        mirror: MirrorHandle,
        link: Arc<dyn DeviceLink>,
        plan: BatteryPlan,
        metrics: Option<HarnessMetrics>,
        broadcast_capacity: usize,
    ) -> Self {
        let (frames, _) = broadcast::channel(broadcast_capacity.max(1));
        Self {
            runner: ScenarioRunner::new(mirror.clone(), link.clone(), plan, metrics.clone()),
            mirror,
            link,
            run_gate: Mutex::new(()),
            mirror_access: tokio::sync::RwLock::new(()),
            running: AtomicBool::new(false),
            last_device: RwLock::new(None),
            frames,
            metrics,
        }
    }

    pub fn plan(&self) -> &BatteryPlan {
        self.runner.plan()
    }

    /// Execute the battery. At most one run is in flight; a second caller is
    /// rejected rather than queued.
    pub async fn run_battery(&self) -> Result<RunReport, RunError> {
        let Ok(_gate) = self.run_gate.try_lock() else {
            warn!("test run rejected; another run is in progress");
            if let Some(metrics) = &self.metrics {
                metrics.record_run(RunOutcome::Rejected, None);
            }
            return Err(RunError::AlreadyRunning);
        };
        let _flag = RunningFlag::raise(&self.running);
        // commands already past the gate finish before the first restore
        let _exclusive = self.mirror_access.write().await;
        self.runner.run().await
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Apply an external wire command. Rejected while a run owns the mirror.
    pub async fn command(&self, name: &str, data: &Value) -> Result<SimulationStatus, CommandError> {
        let command = MirrorCommand::from_wire(name, data)?;
        let Ok(_access) = self.mirror_access.try_read() else {
            debug!(%command, "external command rejected during test run");
            return Err(CommandError::Busy);
        };
        let status = self.mirror.dispatch(command).await?;
        info!(%command, "external command applied");
        Ok(status)
    }

    pub fn simulation(&self) -> SimulationStatus {
        self.mirror.snapshot()
    }

    pub fn status(&self) -> StatusFrame {
        StatusFrame {
            simulation: self.mirror.snapshot(),
            device: self.last_device.read().clone(),
            run_phase: self.runner.phase(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusFrame> {
        self.frames.subscribe()
    }

    /// Poll the device once. A good read replaces the cached telemetry used
    /// in status frames; anything else leaves the cache untouched.
    pub async fn refresh_device(&self) -> Option<DeviceTelemetry> {
        match self.link.read_telemetry().await {
            TelemetryRead::Data(telemetry) => {
                *self.last_device.write() = Some(telemetry.clone());
                Some(telemetry)
            }
            TelemetryRead::Unavailable => None,
            TelemetryRead::Error(err) => {
                warn!(error = %err, "status refresh received malformed telemetry");
                None
            }
        }
    }

    /// Broadcast a frame after every mirror mutation, every phase change and
    /// every refresh tick until `shutdown` flips to `true`.
    pub fn spawn_status_loop(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut mirror_rx = self.mirror.subscribe();
            let mut phase_rx = self.runner.subscribe_phase();
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut mirror_open = true;

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    changed = mirror_rx.changed(), if mirror_open => {
                        if changed.is_err() {
                            warn!("state mirror closed; status frames continue on refresh ticks only");
                            mirror_open = false;
                            continue;
                        }
                        self.publish();
                    }
                    changed = phase_rx.changed() => {
                        if changed.is_ok() {
                            self.publish();
                        }
                    }
                    _ = ticker.tick() => {
                        self.refresh_device().await;
                        self.publish();
                    }
                }
            }
            debug!("status loop stopped");
        })
    }

    fn publish(&self) {
        // no subscribers is not an error
        let _ = self.frames.send(self.status());
    }
}

/// Clears the running flag even when the run future is dropped mid-flight.
struct RunningFlag<'a>(&'a AtomicBool);

impl<'a> RunningFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
