//! ---
//! vsub_section: "01-core-functionality"
//! vsub_subsection: "module"
//! vsub_type: "source"
//! vsub_scope: "code"
//! vsub_description: "Shared primitives and utilities for the coordinator runtime."
//! vsub_version: "v0.1.0"
//! vsub_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;
use url::Url;

use crate::logging::LogFormat;

fn default_telemetry_url() -> String {
    "http://localhost:8082/status".to_owned()
}

fn default_command_url() -> String {
    "http://localhost:8081".to_owned()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_api_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3000))
}

fn default_manual_trip_clear_after() -> Duration {
    Duration::from_secs(3)
}

fn default_status_refresh_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_queue_capacity() -> usize {
    64
}

fn default_broadcast_capacity() -> usize {
    128
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(200)
}

fn default_settle_delay() -> Duration {
    Duration::from_millis(1000)
}

fn default_baseline_window() -> Duration {
    Duration::from_millis(2000)
}

fn default_return_to_normal_window() -> Duration {
    Duration::from_millis(6000)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

/// Primary configuration object for the coordinator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
    #[serde(default)]
    pub battery: BatteryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "VSUB_CONFIG";

    /// Load configuration from disk, respecting the `VSUB_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("failed to load config file {}", path.display()))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.device.validate()?;
        self.mirror.validate()?;
        self.battery.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Location of the externally owned device-under-test.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Endpoint returning the relay telemetry document.
    #[serde(default = "default_telemetry_url")]
    pub telemetry_url: String,
    /// Base URL for commands; the command name is appended as a path segment.
    #[serde(default = "default_command_url")]
    pub command_url: String,
    #[serde(default = "default_request_timeout", rename = "request_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_timeout: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            telemetry_url: default_telemetry_url(),
            command_url: default_command_url(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<()> {
        for (label, value) in [
            ("telemetry_url", &self.telemetry_url),
            ("command_url", &self.command_url),
        ] {
            let url = Url::parse(value)
                .with_context(|| format!("device {} '{}' is not a valid url", label, value))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(anyhow!(
                    "device {} must use http or https, got '{}'",
                    label,
                    url.scheme()
                ));
            }
        }
        if self.request_timeout.is_zero() {
            return Err(anyhow!("device request_timeout_ms must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_listen")]
    pub listen: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_api_listen(),
        }
    }
}

/// Behaviour of the local state mirror and the observer broadcast.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    #[serde(
        default = "default_manual_trip_clear_after",
        rename = "manual_trip_clear_after_ms"
    )]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub manual_trip_clear_after: Duration,
    #[serde(
        default = "default_status_refresh_interval",
        rename = "status_refresh_interval_ms"
    )]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub status_refresh_interval: Duration,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            manual_trip_clear_after: default_manual_trip_clear_after(),
            status_refresh_interval: default_status_refresh_interval(),
            queue_capacity: default_queue_capacity(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

impl MirrorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 || self.broadcast_capacity == 0 {
            return Err(anyhow!("mirror queue and broadcast capacities must be non-zero"));
        }
        if self.status_refresh_interval.is_zero() {
            return Err(anyhow!("mirror status_refresh_interval_ms must be greater than zero"));
        }
        Ok(())
    }
}

/// Trip thresholds implemented by the device-under-test. Only used to check
/// that configured scenario setpoints land in the intended protection band.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProtectionThresholds {
    pub pickup_current: f64,
    pub instantaneous_current: f64,
    pub ground_fault_min: f64,
    pub ground_fault_max: f64,
    pub underfrequency_hz: f64,
}

impl Default for ProtectionThresholds {
    fn default() -> Self {
        Self {
            pickup_current: 1000.0,
            instantaneous_current: 2500.0,
            ground_fault_min: 300.0,
            ground_fault_max: 800.0,
            underfrequency_hz: 48.5,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OvercurrentTimeConfig {
    pub current: f64,
    #[serde(rename = "pickup_window_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub pickup_window: Duration,
    #[serde(rename = "trip_window_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub trip_window: Duration,
}

impl Default for OvercurrentTimeConfig {
    fn default() -> Self {
        Self {
            current: 1500.0,
            pickup_window: Duration::from_millis(1500),
            trip_window: Duration::from_millis(4000),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstantaneousConfig {
    pub current: f64,
    #[serde(rename = "trip_window_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub trip_window: Duration,
}

impl Default for InstantaneousConfig {
    fn default() -> Self {
        Self {
            current: 2600.0,
            trip_window: Duration::from_millis(2000),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroundFaultConfig {
    pub fault_current: f64,
    #[serde(rename = "trip_window_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub trip_window: Duration,
}

impl Default for GroundFaultConfig {
    fn default() -> Self {
        Self {
            fault_current: 500.0,
            trip_window: Duration::from_millis(3000),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnderfrequencyConfig {
    pub frequency: f64,
    #[serde(rename = "trip_window_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub trip_window: Duration,
}

impl Default for UnderfrequencyConfig {
    fn default() -> Self {
        Self {
            frequency: 48.0,
            trip_window: Duration::from_millis(2000),
        }
    }
}

/// Setpoints and timing windows for the built-in protection test battery.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryConfig {
    #[serde(default)]
    pub thresholds: ProtectionThresholds,
    #[serde(default = "default_poll_interval", rename = "poll_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
    #[serde(default = "default_settle_delay", rename = "settle_delay_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub settle_delay: Duration,
    #[serde(default = "default_baseline_window", rename = "baseline_window_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub baseline_window: Duration,
    #[serde(default)]
    pub overcurrent_time: OvercurrentTimeConfig,
    #[serde(default)]
    pub instantaneous: InstantaneousConfig,
    #[serde(default)]
    pub ground_fault: GroundFaultConfig,
    #[serde(default)]
    pub underfrequency: UnderfrequencyConfig,
    #[serde(
        default = "default_return_to_normal_window",
        rename = "return_to_normal_window_ms"
    )]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub return_to_normal_window: Duration,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            thresholds: ProtectionThresholds::default(),
            poll_interval: default_poll_interval(),
            settle_delay: default_settle_delay(),
            baseline_window: default_baseline_window(),
            overcurrent_time: OvercurrentTimeConfig::default(),
            instantaneous: InstantaneousConfig::default(),
            ground_fault: GroundFaultConfig::default(),
            underfrequency: UnderfrequencyConfig::default(),
            return_to_normal_window: default_return_to_normal_window(),
        }
    }
}

impl BatteryConfig {
    /// Check that every scenario setpoint provokes the protection element it
    /// is meant to exercise and that all windows are usable.
    pub fn validate(&self) -> Result<()> {
        let t = &self.thresholds;
        if t.pickup_current >= t.instantaneous_current {
            return Err(anyhow!(
                "pickup threshold {} must be below instantaneous threshold {}",
                t.pickup_current,
                t.instantaneous_current
            ));
        }
        if t.ground_fault_min >= t.ground_fault_max {
            return Err(anyhow!(
                "ground fault band [{}, {}) is empty",
                t.ground_fault_min,
                t.ground_fault_max
            ));
        }

        let oc = self.overcurrent_time.current;
        if !(oc >= t.pickup_current && oc < t.instantaneous_current) {
            return Err(anyhow!(
                "overcurrent_time current {} must lie in [{}, {})",
                oc,
                t.pickup_current,
                t.instantaneous_current
            ));
        }
        if self.instantaneous.current < t.instantaneous_current {
            return Err(anyhow!(
                "instantaneous current {} must be at least {}",
                self.instantaneous.current,
                t.instantaneous_current
            ));
        }
        let gf = self.ground_fault.fault_current;
        if !(gf >= t.ground_fault_min && gf < t.ground_fault_max) {
            return Err(anyhow!(
                "ground_fault fault_current {} must lie in [{}, {})",
                gf,
                t.ground_fault_min,
                t.ground_fault_max
            ));
        }
        if self.underfrequency.frequency >= t.underfrequency_hz {
            return Err(anyhow!(
                "underfrequency setpoint {} must be below {}",
                self.underfrequency.frequency,
                t.underfrequency_hz
            ));
        }

        if self.poll_interval.is_zero() {
            return Err(anyhow!("battery poll_interval_ms must be greater than zero"));
        }
        for (label, window) in [
            ("baseline_window_ms", self.baseline_window),
            ("overcurrent_time.pickup_window_ms", self.overcurrent_time.pickup_window),
            ("overcurrent_time.trip_window_ms", self.overcurrent_time.trip_window),
            ("instantaneous.trip_window_ms", self.instantaneous.trip_window),
            ("ground_fault.trip_window_ms", self.ground_fault.trip_window),
            ("underfrequency.trip_window_ms", self.underfrequency.trip_window),
            ("return_to_normal_window_ms", self.return_to_normal_window),
        ] {
            if window.is_zero() {
                return Err(anyhow!("battery {} must be greater than zero", label));
            }
        }

        let gf_window = self.ground_fault.trip_window;
        if !(gf_window > self.instantaneous.trip_window && gf_window < self.return_to_normal_window)
        {
            return Err(anyhow!(
                "ground_fault trip window {:?} must be longer than the instantaneous window {:?} and shorter than the return-to-normal window {:?}",
                gf_window,
                self.instantaneous.trip_window,
                self.return_to_normal_window
            ));
        }
        if self.overcurrent_time.pickup_window >= self.overcurrent_time.trip_window {
            return Err(anyhow!(
                "overcurrent_time pickup window must be shorter than its trip window"
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}
