//! ---
//! vsub_section: "02-test-orchestration"
//! vsub_subsection: "module"
//! vsub_type: "source"
//! vsub_scope: "code"
//! vsub_description: "Coordinator core: mirror, device client, waiter, runner and reports."
//! vsub_version: "v0.1.0"
//! vsub_owner: "tbd"
//! ---
//! State mirror, device link and the protection scenario runner for the
//! virtual substation coordinator.

pub mod coordinator;
pub mod device;
pub mod error;
pub mod mirror;
pub mod report;
pub mod scenario;
pub mod waiter;

pub use coordinator::{Coordinator, StatusFrame};
pub use device::{DeviceCommand, DeviceError, DeviceLink, DeviceTelemetry, HttpDeviceClient, TelemetryRead};
pub use error::{CommandError, MirrorError, RunError};
pub use mirror::{MirrorCommand, MirrorHandle, Setpoint, SetpointField, SimulationStatus};
pub use report::{aggregate, RunContext, RunReport, StepResult};
pub use scenario::{BatteryPlan, Predicate, RunPhase, Scenario, ScenarioRunner, ScenarioStep, SetupAction};
pub use waiter::{ConditionWaiter, WaitOutcome};
