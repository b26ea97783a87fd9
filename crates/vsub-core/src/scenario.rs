//! ---
//! vsub_section: "02-test-orchestration"
//! vsub_subsection: "module"
//! vsub_type: "source"
//! vsub_scope: "code"
//! vsub_description: "Protection scenario battery and its runner."
//! vsub_version: "v0.1.0"
//! vsub_owner: "tbd"
//! ---
//! A run walks `Idle → Normalizing → Running(i) → Finalizing → Done`.
//! Scenarios execute strictly in order. Every scenario is followed by a
//! baseline restore and settle delay whether or not its steps passed; only a
//! run-level fault stops the battery early.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use vsub_common::time::{duration_to_millis, saturating_sum};
use vsub_common::BatteryConfig;
use vsub_metrics::{HarnessMetrics, RunOutcome};

use crate::device::{DeviceCommand, DeviceLink, DeviceTelemetry};
use crate::error::RunError;
use crate::mirror::{MirrorCommand, MirrorHandle, SetpointField, NOMINAL_FREQUENCY};
use crate::report::{aggregate, RunContext, RunReport, StepResult};
use crate::waiter::ConditionWaiter;

pub type Predicate = Arc<dyn Fn(&DeviceTelemetry) -> bool + Send + Sync>;

/// A named condition to observe within a time budget.
#[derive(Clone)]
pub struct ScenarioStep {
    pub name: String,
    predicate: Predicate,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl ScenarioStep {
    pub fn new<F>(name: impl Into<String>, timeout: Duration, poll_interval: Duration, predicate: F) -> Self
    where
        F: Fn(&DeviceTelemetry) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
            timeout,
            poll_interval,
        }
    }

    pub fn evaluate(&self, telemetry: &DeviceTelemetry) -> bool {
        (self.predicate)(telemetry)
    }
}

impl fmt::Debug for ScenarioStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScenarioStep")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum SetupAction {
    Mirror(MirrorCommand),
    Device(DeviceCommand),
    Settle(Duration),
}

#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: String,
    pub setup: Vec<SetupAction>,
    pub steps: Vec<ScenarioStep>,
    pub teardown: Vec<SetupAction>,
}

impl Scenario {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            setup: Vec::new(),
            steps: Vec::new(),
            teardown: Vec::new(),
        }
    }

    pub fn setup(mut self, action: SetupAction) -> Self {
        self.setup.push(action);
        self
    }

    pub fn step(mut self, step: ScenarioStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn teardown(mut self, action: SetupAction) -> Self {
        self.teardown.push(action);
        self
    }
}

/// Ordered scenarios plus the settle delay used for baseline restores.
#[derive(Debug, Clone)]
pub struct BatteryPlan {
    scenarios: Vec<Scenario>,
    settle_delay: Duration,
}

impl BatteryPlan {
    pub fn new(scenarios: Vec<Scenario>, settle_delay: Duration) -> Self {
        Self {
            scenarios,
            settle_delay,
        }
    }

    /// The fixed protection battery.
    pub fn builtin(config: &BatteryConfig) -> Self {
        let poll = config.poll_interval;
        let settle = config.settle_delay;

        let baseline = Scenario::new("baseline").step(ScenarioStep::new(
            "baseline_normal",
            config.baseline_window,
            poll,
            |t| !t.fault_detected && !t.trip_command,
        ));

        let overcurrent_time = Scenario::new("overcurrent_time")
            .setup(SetupAction::Mirror(MirrorCommand::Set(
                SetpointField::Current,
                config.overcurrent_time.current,
            )))
            .step(ScenarioStep::new(
                "overcurrent_pickup",
                config.overcurrent_time.pickup_window,
                poll,
                |t| t.overcurrent_pickup,
            ))
            .step(ScenarioStep::new(
                "overcurrent_time_trip",
                config.overcurrent_time.trip_window,
                poll,
                DeviceTelemetry::breaker_open,
            ));

        let instantaneous = Scenario::new("overcurrent_instantaneous")
            .setup(SetupAction::Mirror(MirrorCommand::Set(
                SetpointField::Current,
                config.instantaneous.current,
            )))
            .step(ScenarioStep::new(
                "instantaneous_trip",
                config.instantaneous.trip_window,
                poll,
                DeviceTelemetry::breaker_open,
            ));

        let ground_fault = Scenario::new("ground_fault")
            .setup(SetupAction::Mirror(MirrorCommand::Set(
                SetpointField::FaultCurrent,
                config.ground_fault.fault_current,
            )))
            .setup(SetupAction::Mirror(MirrorCommand::ToggleFault(true)))
            .step(ScenarioStep::new(
                "ground_fault_trip",
                config.ground_fault.trip_window,
                poll,
                DeviceTelemetry::breaker_open,
            ));

        let underfrequency = Scenario::new("underfrequency")
            .setup(SetupAction::Mirror(MirrorCommand::Set(
                SetpointField::Frequency,
                config.underfrequency.frequency,
            )))
            .step(ScenarioStep::new(
                "underfrequency_trip",
                config.underfrequency.trip_window,
                poll,
                DeviceTelemetry::breaker_open,
            ))
            .teardown(SetupAction::Mirror(MirrorCommand::Set(
                SetpointField::Frequency,
                NOMINAL_FREQUENCY,
            )));

        let return_to_normal = Scenario::new("return_to_normal")
            .setup(SetupAction::Device(DeviceCommand::Reset))
            .setup(SetupAction::Device(DeviceCommand::Close))
            .setup(SetupAction::Settle(settle))
            .step(ScenarioStep::new(
                "return_to_normal",
                config.return_to_normal_window,
                poll,
                DeviceTelemetry::is_normal,
            ));

        Self::new(
            vec![
                baseline,
                overcurrent_time,
                instantaneous,
                ground_fault,
                underfrequency,
                return_to_normal,
            ],
            settle,
        )
    }

    pub fn scenarios(&self) -> &[Scenario] {
        &self.scenarios
    }

    pub fn settle_delay(&self) -> Duration {
        self.settle_delay
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.scenarios
            .iter()
            .flat_map(|scenario| scenario.steps.iter().map(|step| step.name.as_str()))
            .collect()
    }

    /// Upper bound on one run: every settle delay, every device command at
    /// its request timeout, and per step the full window plus one poll
    /// interval and two reads at the request timeout.
    pub fn worst_case_duration(&self, request_timeout: Duration) -> Duration {
        let restore = self.restore_bound(request_timeout);
        let action_bound = |action: &SetupAction| match action {
            SetupAction::Mirror(_) => Duration::ZERO,
            SetupAction::Device(_) => request_timeout,
            SetupAction::Settle(delay) => *delay,
        };
        let scenarios = self.scenarios.iter().map(|scenario| {
            let setup = saturating_sum(scenario.setup.iter().map(action_bound));
            let teardown = saturating_sum(scenario.teardown.iter().map(action_bound));
            let steps = saturating_sum(scenario.steps.iter().map(|step| {
                step.timeout
                    .saturating_add(step.poll_interval)
                    .saturating_add(request_timeout.saturating_mul(2))
            }));
            saturating_sum([setup, steps, teardown, restore])
        });
        // initial normalisation plus one restore after every scenario
        restore.saturating_add(saturating_sum(scenarios))
    }

    fn restore_bound(&self, request_timeout: Duration) -> Duration {
        self.settle_delay
            .saturating_add(request_timeout.saturating_mul(2))
    }

    fn validate(&self) -> Result<(), RunError> {
        for scenario in &self.scenarios {
            for step in &scenario.steps {
                if step.timeout.is_zero() || step.poll_interval.is_zero() {
                    return Err(RunError::InvalidPlan(format!(
                        "step '{}' of scenario '{}' needs a non-zero timeout and poll interval",
                        step.name, scenario.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Where a run currently is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Normalizing,
    Running { index: usize, scenario: String },
    Finalizing,
    Done,
}

/// Executes a [`BatteryPlan`] against the mirror and the device.
pub struct ScenarioRunner {
    mirror: MirrorHandle,
    link: Arc<dyn DeviceLink>,
    waiter: ConditionWaiter,
    plan: BatteryPlan,
    metrics: Option<HarnessMetrics>,
    phase: watch::Sender<RunPhase>,
}

impl ScenarioRunner {
    pub fn new(
        mirror: MirrorHandle,
        link: Arc<dyn DeviceLink>,
        plan: BatteryPlan,
        metrics: Option<HarnessMetrics>,
    ) -> Self {
        let (phase, _) = watch::channel(RunPhase::Idle);
        Self {
            waiter: ConditionWaiter::new(link.clone(), metrics.clone()),
            mirror,
            link,
            plan,
            metrics,
            phase,
        }
    }

    pub fn plan(&self) -> &BatteryPlan {
        &self.plan
    }

    pub fn phase(&self) -> RunPhase {
        self.phase.borrow().clone()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<RunPhase> {
        self.phase.subscribe()
    }

    /// Run the whole battery once. Callers are responsible for excluding
    /// concurrent runs.
    pub async fn run(&self) -> Result<RunReport, RunError> {
        let context = RunContext::start();
        info!(
            run_id = %context.run_id,
            scenarios = self.plan.scenarios.len(),
            "test battery started"
        );

        let mut results = Vec::new();
        if let Err(err) = self.execute(&mut results).await {
            error!(run_id = %context.run_id, error = %err, kind = err.kind(), completed_steps = results.len(), "test battery aborted");
            self.set_phase(RunPhase::Finalizing);
            if let Err(restore_err) = self.restore_baseline().await {
                warn!(run_id = %context.run_id, error = %restore_err, "baseline restore after abort failed");
            }
            self.set_phase(RunPhase::Done);
            if let Some(metrics) = &self.metrics {
                metrics.record_run(RunOutcome::Fault, None);
            }
            return Err(err);
        }

        let report = aggregate(results, &context);
        self.set_phase(RunPhase::Done);
        info!(
            run_id = %report.run_id,
            ok = report.ok,
            duration_ms = report.duration_ms,
            failed = report.failed_steps().count(),
            "test battery finished"
        );
        if let Some(metrics) = &self.metrics {
            let outcome = if report.ok {
                RunOutcome::Pass
            } else {
                RunOutcome::Fail
            };
            metrics.record_run(outcome, Some(context.started.elapsed()));
        }
        Ok(report)
    }

    async fn execute(&self, results: &mut Vec<StepResult>) -> Result<(), RunError> {
        self.plan.validate()?;

        self.set_phase(RunPhase::Normalizing);
        self.restore_baseline().await?;

        for (index, scenario) in self.plan.scenarios.iter().enumerate() {
            self.set_phase(RunPhase::Running {
                index,
                scenario: scenario.name.clone(),
            });
            debug!(index, scenario = %scenario.name, "scenario setup");
            self.apply_actions(&scenario.setup).await?;

            for step in &scenario.steps {
                let outcome = self
                    .waiter
                    .wait_for(|t| step.evaluate(t), step.timeout, step.poll_interval)
                    .await
                    .map_err(|source| RunError::Device {
                        step: step.name.clone(),
                        source,
                    })?;
                if let Some(metrics) = &self.metrics {
                    metrics.record_step(&step.name, outcome.ok, outcome.elapsed);
                }
                let result = StepResult::from_outcome(step.name.clone(), outcome);
                if result.ok {
                    info!(scenario = %scenario.name, step = %result.name, elapsed_ms = result.elapsed_ms, "step passed");
                } else {
                    warn!(
                        scenario = %scenario.name,
                        step = %result.name,
                        elapsed_ms = result.elapsed_ms,
                        timeout_ms = duration_to_millis(step.timeout),
                        last = ?result.data,
                        "step failed"
                    );
                }
                results.push(result);
            }

            self.apply_actions(&scenario.teardown).await?;
            if index + 1 < self.plan.scenarios.len() {
                self.restore_baseline().await?;
            }
        }

        self.set_phase(RunPhase::Finalizing);
        self.restore_baseline().await?;
        Ok(())
    }

    async fn apply_actions(&self, actions: &[SetupAction]) -> Result<(), RunError> {
        for action in actions {
            match action {
                SetupAction::Mirror(command) => {
                    self.mirror.dispatch(*command).await?;
                }
                SetupAction::Device(command) => {
                    self.device_command(*command).await;
                }
                SetupAction::Settle(delay) => tokio::time::sleep(*delay).await,
            }
        }
        Ok(())
    }

    /// Setpoints first so the device does not re-trip on stale inputs, then
    /// reset and close, then settle.
    async fn restore_baseline(&self) -> Result<(), RunError> {
        self.mirror.dispatch(MirrorCommand::Normalize).await?;
        self.device_command(DeviceCommand::Reset).await;
        self.device_command(DeviceCommand::Close).await;
        tokio::time::sleep(self.plan.settle_delay).await;
        Ok(())
    }

    async fn device_command(&self, command: DeviceCommand) {
        if !self.link.send_command(command).await {
            warn!(%command, "device did not acknowledge command; continuing");
        }
    }

    fn set_phase(&self, phase: RunPhase) {
        debug!(?phase, "run phase");
        self.phase.send_replace(phase);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_battery_orders_steps() {
        let plan = BatteryPlan::builtin(&BatteryConfig::default());
        assert_eq!(
            plan.step_names(),
            vec![
                "baseline_normal",
                "overcurrent_pickup",
                "overcurrent_time_trip",
                "instantaneous_trip",
                "ground_fault_trip",
                "underfrequency_trip",
                "return_to_normal",
            ]
        );
    }

    #[test]
    fn instantaneous_scenario_has_no_pickup_step() {
        let plan = BatteryPlan::builtin(&BatteryConfig::default());
        let scenario = plan
            .scenarios()
            .iter()
            .find(|s| s.name == "overcurrent_instantaneous")
            .unwrap();
        assert_eq!(scenario.steps.len(), 1);
        assert_eq!(scenario.steps[0].timeout, Duration::from_millis(2000));
        assert!(matches!(
            scenario.setup[0],
            SetupAction::Mirror(MirrorCommand::Set(SetpointField::Current, c)) if c == 2600.0
        ));
    }

    #[test]
    fn worst_case_duration_with_defaults() {
        let plan = BatteryPlan::builtin(&BatteryConfig::default());
        let rt = Duration::from_secs(1);
        // restore = 1000 + 2 * 1000 = 3000, seven restores in total
        // steps: windows 20_500 + 7 * (200 + 2000) = 35_900
        // return_to_normal setup: 2 * 1000 + 1000 = 3000
        let expected = Duration::from_millis(7 * 3000 + 35_900 + 3000);
        assert_eq!(plan.worst_case_duration(rt), expected);
    }

    #[test]
    fn worst_case_saturates_for_unbounded_request_timeout() {
        let plan = BatteryPlan::builtin(&BatteryConfig::default());
        let bound = plan.worst_case_duration(Duration::MAX);
        assert_eq!(bound, Duration::MAX);
        assert_eq!(duration_to_millis(bound), u64::MAX);
    }

    #[test]
    fn zero_timeout_step_is_an_invalid_plan() {
        let plan = BatteryPlan::new(
            vec![Scenario::new("broken").step(ScenarioStep::new(
                "never",
                Duration::ZERO,
                Duration::from_millis(10),
                |_| true,
            ))],
            Duration::ZERO,
        );
        assert!(matches!(plan.validate(), Err(RunError::InvalidPlan(_))));
    }

    #[test]
    fn phase_serialises_with_tag() {
        let value = serde_json::to_value(RunPhase::Running {
            index: 2,
            scenario: "overcurrent_instantaneous".into(),
        })
        .unwrap();
        assert_eq!(value["phase"], "running");
        assert_eq!(value["index"], 2);
    }
}
