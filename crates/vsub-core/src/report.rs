//! ---
//! vsub_section: "02-test-orchestration"
//! vsub_subsection: "module"
//! vsub_type: "source"
//! vsub_scope: "code"
//! vsub_description: "Step results and run report aggregation."
//! vsub_version: "v0.1.0"
//! vsub_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;
use vsub_common::time::duration_to_millis;

use crate::device::DeviceTelemetry;
use crate::waiter::WaitOutcome;

/// Outcome of one named scenario step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub name: String,
    pub ok: bool,
    pub data: Option<DeviceTelemetry>,
    pub elapsed_ms: u64,
}

impl StepResult {
    pub fn from_outcome(name: impl Into<String>, outcome: WaitOutcome) -> Self {
        Self {
            name: name.into(),
            ok: outcome.ok,
            data: outcome.data,
            elapsed_ms: duration_to_millis(outcome.elapsed),
        }
    }
}

/// Identity and monotonic start of a run.
#[derive(Debug, Clone, Copy)]
pub struct RunContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub started: Instant,
}

impl RunContext {
    pub fn start() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }
}

/// Aggregated outcome of a complete battery run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ok: bool,
    pub duration_ms: u64,
    pub results: Vec<StepResult>,
}

impl RunReport {
    pub fn failed_steps(&self) -> impl Iterator<Item = &StepResult> {
        self.results.iter().filter(|result| !result.ok)
    }

    /// Pass/fail pattern, ignoring timings and telemetry.
    pub fn outcome_signature(&self) -> Vec<(&str, bool)> {
        self.results
            .iter()
            .map(|result| (result.name.as_str(), result.ok))
            .collect()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "run {} {} in {} ms",
            self.run_id,
            if self.ok { "PASSED" } else { "FAILED" },
            self.duration_ms
        )?;
        for result in &self.results {
            writeln!(
                f,
                "  [{}] {:<24} {:>6} ms",
                if result.ok { "ok" } else { "!!" },
                result.name,
                result.elapsed_ms
            )?;
        }
        Ok(())
    }
}

/// Reduce ordered step results into a report. `ok` is the conjunction of all
/// step outcomes; an empty sequence is vacuously ok.
pub fn aggregate(results: Vec<StepResult>, context: &RunContext) -> RunReport {
    RunReport {
        run_id: context.run_id,
        started_at: context.started_at,
        ok: results.iter().all(|result| result.ok),
        duration_ms: duration_to_millis(context.started.elapsed()),
        results,
    }
}
