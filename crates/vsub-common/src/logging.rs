//! ---
//! vsub_section: "01-core-functionality"
//! vsub_subsection: "module"
//! vsub_type: "source"
//! vsub_scope: "code"
//! vsub_description: "Tracing subscriber setup shared by coordinator binaries."
//! vsub_version: "v0.1.0"
//! vsub_owner: "tbd"
//! ---
use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

/// Filter override consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "VSUB_LOG";
const DEFAULT_DIRECTIVE: &str = "debug";

static GUARDS: OnceCell<[WorkerGuard; 2]> = OnceCell::new();

/// Stdout rendering. The rolling file is always JSON.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Install the global subscriber: stdout in the configured format plus a
/// daily rolling `{prefix}.log` under `config.directory`. A second call is a
/// no-op.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory)?;
    let prefix = config.file_prefix.as_deref().unwrap_or(service_name);

    let (file_writer, file_guard) =
        tracing_appender::non_blocking(daily(&config.directory, format!("{prefix}.log")));
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let _ = GUARDS.set([file_guard, stdout_guard]);

    let (filter, rejected) = resolve_filter(
        std::env::var(LOG_ENV).ok(),
        std::env::var(EnvFilter::DEFAULT_ENV).ok(),
    );

    let stdout_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_current_span(false)
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };
    let file_layer = fmt::layer()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_writer(file_writer)
        .boxed();

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    if let Some(directive) = rejected {
        warn!(%directive, "ignored invalid log filter directive");
    }
    if installed {
        info!(service = %service_name, log_dir = %config.directory.display(), format = ?config.format, "tracing initialised");
    }
    Ok(())
}

/// Pick the first directive that parses, `VSUB_LOG` before `RUST_LOG`,
/// defaulting to `debug`. Also returns the first directive that was rejected.
fn resolve_filter(primary: Option<String>, fallback: Option<String>) -> (EnvFilter, Option<String>) {
    let mut rejected = None;
    for directive in [primary, fallback].into_iter().flatten() {
        match EnvFilter::try_new(&directive) {
            Ok(filter) => return (filter, rejected),
            Err(_) => {
                rejected.get_or_insert(directive);
            }
        }
    }
    (EnvFilter::new(DEFAULT_DIRECTIVE), rejected)
}
