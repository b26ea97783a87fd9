//! ---
//! vsub_section: "03-observability"
//! vsub_subsection: "module"
//! vsub_type: "source"
//! vsub_scope: "code"
//! vsub_description: "Metrics collection and export utilities."
//! vsub_version: "v0.1.0"
//! vsub_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use tracing::error;

/// Shared registry type used across the workspace.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Render the registry in the Prometheus text exposition format.
pub fn encode_text(registry: &Registry) -> Option<String> {
    let families = registry.gather();
    match TextEncoder::new().encode_to_string(&families) {
        Ok(body) => Some(body),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            None
        }
    }
}

/// Outcome label attached to `vsub_runs_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Pass,
    Fail,
    Fault,
    Rejected,
}

impl RunOutcome {
    fn as_label(self) -> &'static str {
        match self {
            RunOutcome::Pass => "pass",
            RunOutcome::Fail => "fail",
            RunOutcome::Fault => "fault",
            RunOutcome::Rejected => "rejected",
        }
    }
}

/// Metrics recorded by the test battery and the state mirror.
#[derive(Clone)]
pub struct HarnessMetrics {
    registry: SharedRegistry,
    runs_total: IntCounterVec,
    run_duration_seconds: Histogram,
    steps_total: IntCounterVec,
    step_elapsed_seconds: HistogramVec,
    device_unavailable_total: IntCounter,
    commands_total: IntCounterVec,
}

impl HarnessMetrics {
    /// Register the harness metric family against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let runs_total = IntCounterVec::new(
            Opts::new("vsub_runs_total", "Protection test battery runs by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(runs_total.clone()))?;

        let run_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "vsub_run_duration_seconds",
                "Wall duration of completed test battery runs",
            )
            .buckets(prometheus::linear_buckets(5.0, 5.0, 12)?),
        )?;
        registry.register(Box::new(run_duration_seconds.clone()))?;

        let steps_total = IntCounterVec::new(
            Opts::new("vsub_steps_total", "Scenario steps evaluated by outcome"),
            &["step", "outcome"],
        )?;
        registry.register(Box::new(steps_total.clone()))?;

        let step_elapsed_seconds = HistogramVec::new(
            HistogramOpts::new(
                "vsub_step_elapsed_seconds",
                "Time until a scenario step condition was observed or timed out",
            )
            .buckets(prometheus::exponential_buckets(0.05, 2.0, 10)?),
            &["step"],
        )?;
        registry.register(Box::new(step_elapsed_seconds.clone()))?;

        let device_unavailable_total = IntCounter::with_opts(Opts::new(
            "vsub_device_unavailable_total",
            "Telemetry polls that returned no data from the device-under-test",
        ))?;
        registry.register(Box::new(device_unavailable_total.clone()))?;

        let commands_total = IntCounterVec::new(
            Opts::new("vsub_commands_total", "Commands applied to the state mirror"),
            &["command"],
        )?;
        registry.register(Box::new(commands_total.clone()))?;

        Ok(Self {
            registry,
            runs_total,
            run_duration_seconds,
            steps_total,
            step_elapsed_seconds,
            device_unavailable_total,
            commands_total,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_run(&self, outcome: RunOutcome, duration: Option<Duration>) {
        self.runs_total.with_label_values(&[outcome.as_label()]).inc();
        if let Some(duration) = duration {
            self.run_duration_seconds.observe(duration.as_secs_f64());
        }
    }

    pub fn record_step(&self, step: &str, ok: bool, elapsed: Duration) {
        let outcome = if ok { "pass" } else { "fail" };
        self.steps_total.with_label_values(&[step, outcome]).inc();
        self.step_elapsed_seconds
            .with_label_values(&[step])
            .observe(elapsed.as_secs_f64());
    }

    pub fn inc_device_unavailable(&self) {
        self.device_unavailable_total.inc();
    }

    pub fn inc_command(&self, command: &str) {
        self.commands_total.with_label_values(&[command]).inc();
    }
}
