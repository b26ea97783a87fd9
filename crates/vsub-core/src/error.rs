//! ---
//! vsub_section: "02-test-orchestration"
//! vsub_subsection: "module"
//! vsub_type: "source"
//! vsub_scope: "code"
//! vsub_description: "Error taxonomy for the coordinator core."
//! vsub_version: "v0.1.0"
//! vsub_owner: "tbd"
//! ---
use crate::device::DeviceError;

/// Failure to reach the state mirror actor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MirrorError {
    #[error("state mirror has shut down")]
    Closed,
}

/// Errors returned when applying an inbound command.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// A test battery currently owns the mirror.
    #[error("a test run is in progress; commands are rejected until it completes")]
    Busy,
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("invalid command payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Mirror(#[from] MirrorError),
}

/// Run-level failures. A run that completes with failed steps is not an
/// error; it is a report with `ok = false`.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("a test run is already in progress")]
    AlreadyRunning,
    #[error("invalid battery plan: {0}")]
    InvalidPlan(String),
    #[error("state mirror unavailable during run: {0}")]
    Mirror(#[from] MirrorError),
    #[error("device fault during step '{step}': {source}")]
    Device {
        step: String,
        #[source]
        source: DeviceError,
    },
}

impl RunError {
    /// Stable machine-readable label used in API responses and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            RunError::AlreadyRunning => "already_running",
            RunError::InvalidPlan(_) => "invalid_plan",
            RunError::Mirror(_) => "mirror_closed",
            RunError::Device { .. } => "device_fault",
        }
    }
}
