//! ---
//! vsub_section: "02-test-orchestration"
//! vsub_subsection: "test-support"
//! vsub_type: "source"
//! vsub_scope: "test"
//! vsub_description: "In-process protection relay driven by the state mirror."
//! vsub_version: "v0.1.0"
//! vsub_owner: "tbd"
//! ---
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use vsub_common::{BatteryConfig, DeviceConfig, MirrorConfig};
use vsub_core::{
    BatteryPlan, Coordinator, DeviceCommand, DeviceError, DeviceLink, DeviceTelemetry,
    MirrorHandle, TelemetryRead,
};

const PICKUP_CURRENT: f64 = 1000.0;
const INSTANTANEOUS_CURRENT: f64 = 2500.0;
const GROUND_PICKUP: f64 = 300.0;
const GROUND_INSTANTANEOUS: f64 = 800.0;
const UNDERFREQUENCY_HZ: f64 = 48.5;
const TIME_OVERCURRENT_DELAY: Duration = Duration::from_millis(1000);
const TIME_GROUND_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
struct RelayState {
    overcurrent_since: Option<Instant>,
    ground_since: Option<Instant>,
    trip: bool,
    breaker_open: bool,
    reason: Option<&'static str>,
}

impl RelayState {
    fn clear_pickups(&mut self) {
        self.overcurrent_since = None;
        self.ground_since = None;
    }

    fn trip(&mut self, reason: &'static str) {
        if !self.trip {
            self.trip = true;
            self.reason = Some(reason);
        }
        // breaker follows the trip output
        self.breaker_open = true;
    }
}

/// Protection relay evaluated lazily on every telemetry read against the
/// current mirror snapshot. Time-delayed elements run on the tokio clock so
/// paused-time tests stay deterministic.
pub struct SimulatedRelay {
    mirror: MirrorHandle,
    state: Mutex<RelayState>,
    reachable: AtomicBool,
    malformed: AtomicBool,
    time_overcurrent_enabled: AtomicBool,
    ignore_close: AtomicBool,
    reads: AtomicUsize,
    commands: Mutex<Vec<DeviceCommand>>,
}

impl SimulatedRelay {
    pub fn new(mirror: MirrorHandle) -> Arc<Self> {
        Arc::new(Self {
            mirror,
            state: Mutex::new(RelayState::default()),
            reachable: AtomicBool::new(true),
            malformed: AtomicBool::new(false),
            time_overcurrent_enabled: AtomicBool::new(true),
            ignore_close: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_malformed(&self, malformed: bool) {
        self.malformed.store(malformed, Ordering::SeqCst);
    }

    /// Disable the 51 element; pickup is still reported.
    pub fn set_time_overcurrent_enabled(&self, enabled: bool) {
        self.time_overcurrent_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Acknowledge `close` without moving the breaker.
    pub fn set_ignore_close(&self, ignore: bool) {
        self.ignore_close.store(ignore, Ordering::SeqCst);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<DeviceCommand> {
        self.commands.lock().clone()
    }

    fn evaluate(&self) -> DeviceTelemetry {
        let inputs = self.mirror.snapshot();
        let now = Instant::now();
        let mut state = self.state.lock();

        if inputs.current < PICKUP_CURRENT && inputs.fault_current < GROUND_PICKUP {
            state.clear_pickups();
        }

        if inputs.current >= INSTANTANEOUS_CURRENT {
            state.trip("50-Instantaneous O/C");
        } else if inputs.current >= PICKUP_CURRENT {
            let since = *state.overcurrent_since.get_or_insert(now);
            if now.duration_since(since) > TIME_OVERCURRENT_DELAY
                && self.time_overcurrent_enabled.load(Ordering::SeqCst)
            {
                state.trip("51-Time O/C");
            }
        }

        if inputs.fault_current >= GROUND_INSTANTANEOUS {
            state.trip("50G-Instantaneous GF");
        } else if inputs.fault_current >= GROUND_PICKUP {
            let since = *state.ground_since.get_or_insert(now);
            if now.duration_since(since) > TIME_GROUND_DELAY {
                state.trip("51G-Time GF");
            }
        }

        if inputs.frequency < UNDERFREQUENCY_HZ {
            state.trip("81U-Underfrequency");
        }

        DeviceTelemetry {
            voltage: inputs.voltage,
            current: inputs.current,
            frequency: inputs.frequency,
            fault_current: inputs.fault_current,
            fault_detected: state.overcurrent_since.is_some() || state.ground_since.is_some(),
            trip_command: state.trip,
            breaker_status: state.breaker_open,
            overcurrent_pickup: state.overcurrent_since.is_some(),
            trip_reason: Some(state.reason.unwrap_or("Normal").to_owned()),
        }
    }
}

#[async_trait]
impl DeviceLink for SimulatedRelay {
    async fn read_telemetry(&self) -> TelemetryRead {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if !self.reachable.load(Ordering::SeqCst) {
            return TelemetryRead::Unavailable;
        }
        if self.malformed.load(Ordering::SeqCst) {
            return TelemetryRead::Error(DeviceError::Malformed("expected value at line 1".into()));
        }
        TelemetryRead::Data(self.evaluate())
    }

    async fn send_command(&self, command: DeviceCommand) -> bool {
        self.commands.lock().push(command);
        if !self.reachable.load(Ordering::SeqCst) {
            return false;
        }
        let mut state = self.state.lock();
        match command {
            DeviceCommand::Reset => {
                state.trip = false;
                state.reason = None;
                state.clear_pickups();
            }
            DeviceCommand::Close => {
                if !self.ignore_close.load(Ordering::SeqCst) {
                    state.breaker_open = false;
                }
            }
            DeviceCommand::Open => state.breaker_open = true,
            DeviceCommand::Trip => state.trip("Manual Trip"),
        }
        true
    }
}

pub fn device_config() -> DeviceConfig {
    DeviceConfig {
        request_timeout: Duration::from_millis(250),
        ..DeviceConfig::default()
    }
}

/// Mirror, relay and coordinator wired together with the builtin battery.
pub fn harness() -> (Arc<Coordinator>, Arc<SimulatedRelay>, MirrorHandle) {
    let (mirror, _task) = MirrorHandle::spawn(&MirrorConfig::default(), None);
    let relay = SimulatedRelay::new(mirror.clone());
    let plan = BatteryPlan::builtin(&BatteryConfig::default());
    let coordinator = Arc::new(Coordinator::new(
        mirror.clone(),
        relay.clone(),
        plan,
        None,
        16,
    ));
    (coordinator, relay, mirror)
}
