//! ---
//! vsub_section: "02-test-orchestration"
//! vsub_subsection: "module"
//! vsub_type: "source"
//! vsub_scope: "code"
//! vsub_description: "Client for the externally owned device-under-test."
//! vsub_version: "v0.1.0"
//! vsub_owner: "tbd"
//! ---
use std::fmt;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vsub_common::DeviceConfig;

/// Read-only snapshot reported by the protection relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceTelemetry {
    pub voltage: f64,
    pub current: f64,
    pub frequency: f64,
    #[serde(default)]
    pub fault_current: f64,
    pub fault_detected: bool,
    pub trip_command: bool,
    /// `true` means open.
    pub breaker_status: bool,
    pub overcurrent_pickup: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trip_reason: Option<String>,
}

impl DeviceTelemetry {
    pub fn breaker_open(&self) -> bool {
        self.breaker_status
    }

    /// No fault, no trip, breaker closed.
    pub fn is_normal(&self) -> bool {
        !self.fault_detected && !self.trip_command && !self.breaker_status
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("malformed telemetry payload: {0}")]
    Malformed(String),
}

/// Result of a single telemetry poll.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryRead {
    Data(DeviceTelemetry),
    /// Unreachable, timed out or a non-success status. No information this poll.
    Unavailable,
    /// The device answered but the answer could not be understood.
    Error(DeviceError),
}

impl TelemetryRead {
    pub fn data(&self) -> Option<&DeviceTelemetry> {
        match self {
            TelemetryRead::Data(telemetry) => Some(telemetry),
            _ => None,
        }
    }
}

/// Operations accepted by the device command endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceCommand {
    Reset,
    Close,
    Open,
    Trip,
}

impl DeviceCommand {
    pub fn path(self) -> &'static str {
        match self {
            DeviceCommand::Reset => "reset",
            DeviceCommand::Close => "close",
            DeviceCommand::Open => "open",
            DeviceCommand::Trip => "trip",
        }
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Transport seam towards the device-under-test. Implementations never
/// surface transport errors; they collapse them into the sentinel outcomes.
#[async_trait]
pub trait DeviceLink: Send + Sync + 'static {
    async fn read_telemetry(&self) -> TelemetryRead;

    /// Returns whether the device accepted the command.
    async fn send_command(&self, command: DeviceCommand) -> bool;
}

/// HTTP implementation of [`DeviceLink`].
#[derive(Debug, Clone)]
pub struct HttpDeviceClient {
    client: reqwest::Client,
    telemetry_url: String,
    command_url: String,
}

impl HttpDeviceClient {
    pub fn from_config(config: &DeviceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("failed to build device http client")?;
        Ok(Self {
            client,
            telemetry_url: config.telemetry_url.clone(),
            command_url: config.command_url.trim_end_matches('/').to_owned(),
        })
    }

    fn command_endpoint(&self, command: DeviceCommand) -> String {
        format!("{}/{}", self.command_url, command.path())
    }
}

#[async_trait]
impl DeviceLink for HttpDeviceClient {
    async fn read_telemetry(&self) -> TelemetryRead {
        let response = match self.client.get(&self.telemetry_url).send().await {
            Ok(response) => response,
            Err(err) => {
                debug!(url = %self.telemetry_url, error = %err, "device telemetry unreachable");
                return TelemetryRead::Unavailable;
            }
        };
        let status = response.status();
        if !status.is_success() {
            debug!(url = %self.telemetry_url, status = %status, "device telemetry request rejected");
            return TelemetryRead::Unavailable;
        }
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(err) => {
                debug!(url = %self.telemetry_url, error = %err, "device telemetry body interrupted");
                return TelemetryRead::Unavailable;
            }
        };
        match serde_json::from_slice::<DeviceTelemetry>(&body) {
            Ok(telemetry) => TelemetryRead::Data(telemetry),
            Err(err) => {
                warn!(url = %self.telemetry_url, error = %err, "device telemetry could not be decoded");
                TelemetryRead::Error(DeviceError::Malformed(err.to_string()))
            }
        }
    }

    async fn send_command(&self, command: DeviceCommand) -> bool {
        let url = self.command_endpoint(command);
        match self.client.post(&url).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(%command, url = %url, "device accepted command");
                true
            }
            Ok(response) => {
                warn!(%command, url = %url, status = %response.status(), "device rejected command");
                false
            }
            Err(err) => {
                warn!(%command, url = %url, error = %err, "device command not delivered");
                false
            }
        }
    }
}
