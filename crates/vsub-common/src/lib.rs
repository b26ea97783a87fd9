//! ---
//! vsub_section: "01-core-functionality"
//! vsub_subsection: "module"
//! vsub_type: "source"
//! vsub_scope: "code"
//! vsub_description: "Shared primitives and utilities for the coordinator runtime."
//! vsub_version: "v0.1.0"
//! vsub_owner: "tbd"
//! ---
//! Shared primitives for the virtual substation coordinator workspace.
//! This crate exposes configuration loading, logging and time helpers
//! consumed across the workspace.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    ApiConfig, AppConfig, BatteryConfig, DeviceConfig, GroundFaultConfig, InstantaneousConfig,
    LoadedAppConfig, LoggingConfig, MetricsConfig, MirrorConfig, OvercurrentTimeConfig,
    ProtectionThresholds, UnderfrequencyConfig,
};
pub use logging::{init_tracing, LogFormat, LOG_ENV};
