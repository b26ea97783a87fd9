//! ---
//! vsub_section: "02-test-orchestration"
//! vsub_subsection: "module"
//! vsub_type: "source"
//! vsub_scope: "code"
//! vsub_description: "Polling primitive used by the scenario runner."
//! vsub_version: "v0.1.0"
//! vsub_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::trace;
use vsub_metrics::HarnessMetrics;

use crate::device::{DeviceError, DeviceLink, DeviceTelemetry, TelemetryRead};

/// Result of waiting for a telemetry condition.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitOutcome {
    pub ok: bool,
    /// Satisfying snapshot on success, otherwise the final diagnostic read.
    pub data: Option<DeviceTelemetry>,
    pub elapsed: Duration,
}

/// Polls the device until a predicate holds or a deadline passes.
#[derive(Clone)]
pub struct ConditionWaiter {
    link: Arc<dyn DeviceLink>,
    metrics: Option<HarnessMetrics>,
}

impl ConditionWaiter {
    pub fn new(link: Arc<dyn DeviceLink>, metrics: Option<HarnessMetrics>) -> Self {
        Self { link, metrics }
    }

    /// Unavailable reads are skipped without evaluating the predicate. A
    /// malformed read aborts the wait. On timeout one extra read is taken so
    /// the outcome carries the freshest snapshot available.
    pub async fn wait_for<P>(
        &self,
        predicate: P,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<WaitOutcome, DeviceError>
    where
        P: Fn(&DeviceTelemetry) -> bool,
    {
        let started = Instant::now();
        let mut polls = 0u32;
        loop {
            polls += 1;
            if let Some(telemetry) = self.poll().await? {
                if predicate(&telemetry) {
                    return Ok(WaitOutcome {
                        ok: true,
                        data: Some(telemetry),
                        elapsed: started.elapsed(),
                    });
                }
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                break;
            }
            sleep(poll_interval.min(timeout - elapsed)).await;
        }

        trace!(polls, "condition not met before deadline; taking final read");
        let data = self.poll().await?;
        Ok(WaitOutcome {
            ok: false,
            data,
            elapsed: started.elapsed(),
        })
    }

    async fn poll(&self) -> Result<Option<DeviceTelemetry>, DeviceError> {
        match self.link.read_telemetry().await {
            TelemetryRead::Data(telemetry) => Ok(Some(telemetry)),
            TelemetryRead::Unavailable => {
                if let Some(metrics) = &self.metrics {
                    metrics.inc_device_unavailable();
                }
                Ok(None)
            }
            TelemetryRead::Error(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::device::DeviceCommand;

    fn telemetry(breaker_open: bool) -> DeviceTelemetry {
        DeviceTelemetry {
            voltage: 132.0,
            current: 450.0,
            frequency: 50.0,
            fault_current: 0.0,
            fault_detected: false,
            trip_command: false,
            breaker_status: breaker_open,
            overcurrent_pickup: false,
            trip_reason: None,
        }
    }

    /// Replays a script of reads; the last entry repeats forever.
    struct ScriptedLink {
        script: Mutex<VecDeque<TelemetryRead>>,
        reads: AtomicUsize,
    }

    impl ScriptedLink {
        fn new(script: impl IntoIterator<Item = TelemetryRead>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into_iter().collect()),
                reads: AtomicUsize::new(0),
            })
        }

        fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DeviceLink for ScriptedLink {
        async fn read_telemetry(&self) -> TelemetryRead {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock();
            if script.len() > 1 {
                script.pop_front().unwrap_or(TelemetryRead::Unavailable)
            } else {
                script.front().cloned().unwrap_or(TelemetryRead::Unavailable)
            }
        }

        async fn send_command(&self, _command: DeviceCommand) -> bool {
            true
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_poll_success_returns_immediately() {
        let link = ScriptedLink::new([TelemetryRead::Data(telemetry(true))]);
        let waiter = ConditionWaiter::new(link.clone(), None);
        let outcome = waiter
            .wait_for(
                DeviceTelemetry::breaker_open,
                Duration::from_secs(2),
                Duration::from_millis(100),
            )
            .await
            .unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.elapsed, Duration::ZERO);
        assert_eq!(link.reads(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_a_few_polls_is_not_delayed() {
        let link = ScriptedLink::new([
            TelemetryRead::Data(telemetry(false)),
            TelemetryRead::Data(telemetry(false)),
            TelemetryRead::Data(telemetry(true)),
        ]);
        let waiter = ConditionWaiter::new(link.clone(), None);
        let outcome = waiter
            .wait_for(
                DeviceTelemetry::breaker_open,
                Duration::from_secs(2),
                Duration::from_millis(100),
            )
            .await
            .unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.elapsed, Duration::from_millis(200));
        assert_eq!(link.reads(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_reads_never_reach_the_predicate() {
        let link = ScriptedLink::new([TelemetryRead::Unavailable]);
        let waiter = ConditionWaiter::new(link.clone(), None);
        let evaluated = AtomicUsize::new(0);
        let outcome = waiter
            .wait_for(
                |_| {
                    evaluated.fetch_add(1, Ordering::SeqCst);
                    true
                },
                Duration::from_millis(500),
                Duration::from_millis(100),
            )
            .await
            .unwrap();
        assert!(!outcome.ok);
        assert!(outcome.data.is_none());
        assert_eq!(evaluated.load(Ordering::SeqCst), 0);
        assert!(link.reads() >= 6);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_bounded_and_takes_one_final_read() {
        let link = ScriptedLink::new([TelemetryRead::Data(telemetry(false))]);
        let waiter = ConditionWaiter::new(link.clone(), None);
        let timeout = Duration::from_millis(1000);
        let poll = Duration::from_millis(300);
        let outcome = waiter
            .wait_for(DeviceTelemetry::breaker_open, timeout, poll)
            .await
            .unwrap();
        assert!(!outcome.ok);
        assert_eq!(outcome.data, Some(telemetry(false)));
        assert!(outcome.elapsed <= timeout + poll);
        // polls at 0, 300, 600, 900, 1000 then the final diagnostic read
        assert_eq!(link.reads(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn final_read_may_be_absent() {
        let link = ScriptedLink::new([
            TelemetryRead::Data(telemetry(false)),
            TelemetryRead::Data(telemetry(false)),
            TelemetryRead::Unavailable,
        ]);
        let waiter = ConditionWaiter::new(link, None);
        let outcome = waiter
            .wait_for(
                DeviceTelemetry::breaker_open,
                Duration::from_millis(100),
                Duration::from_millis(100),
            )
            .await
            .unwrap();
        assert!(!outcome.ok);
        assert!(outcome.data.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_read_aborts_the_wait() {
        let link = ScriptedLink::new([
            TelemetryRead::Unavailable,
            TelemetryRead::Error(DeviceError::Malformed("truncated".into())),
        ]);
        let waiter = ConditionWaiter::new(link, None);
        let err = waiter
            .wait_for(
                DeviceTelemetry::breaker_open,
                Duration::from_secs(1),
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert_eq!(err, DeviceError::Malformed("truncated".into()));
    }
}
