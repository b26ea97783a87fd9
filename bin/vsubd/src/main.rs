//! ---
//! vsub_section: "03-coordination"
//! vsub_subsection: "binary"
//! vsub_type: "source"
//! vsub_scope: "code"
//! vsub_description: "Binary entrypoint for the coordinator daemon."
//! vsub_version: "v0.1.0"
//! vsub_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use vsub_common::time::duration_to_millis;
use vsub_common::{init_tracing, AppConfig};
use vsub_core::{BatteryPlan, Coordinator, HttpDeviceClient, MirrorHandle};
use vsub_metrics::{new_registry, HarnessMetrics, SharedRegistry};
use vsub_net::{RestApiBuilder, RestApiHandle};

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("vsubd ", env!("CARGO_PKG_VERSION")),
    about = "Virtual substation coordinator",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "URL", help = "Override the device telemetry endpoint")]
    telemetry_url: Option<String>,

    #[arg(long, value_name = "URL", help = "Override the device command base URL")]
    command_url: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Serve the state mirror and API until interrupted")]
    Serve,
    #[command(about = "Run the protection test battery once and print the report")]
    RunTests,
}

/// Everything started for either subcommand.
struct Runtime {
    coordinator: Arc<Coordinator>,
    api: RestApiHandle,
    status_loop: JoinHandle<()>,
    mirror_task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl Runtime {
    async fn start(config: &AppConfig) -> Result<Self> {
        let (registry, metrics) = if config.metrics.enabled {
            let registry = new_registry();
            let metrics = HarnessMetrics::new(registry.clone())?;
            (Some(registry), Some(metrics))
        } else {
            info!("metrics disabled by configuration");
            (None, None)
        };

        let (mirror, mirror_task) = MirrorHandle::spawn(&config.mirror, metrics.clone());
        let link = Arc::new(HttpDeviceClient::from_config(&config.device)?);
        let plan = BatteryPlan::builtin(&config.battery);
        info!(
            steps = plan.step_names().len(),
            worst_case_ms = duration_to_millis(plan.worst_case_duration(config.device.request_timeout)),
            "test battery loaded"
        );
        let coordinator = Arc::new(Coordinator::new(
            mirror,
            link,
            plan,
            metrics,
            config.mirror.broadcast_capacity,
        ));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let status_loop = coordinator
            .clone()
            .spawn_status_loop(config.mirror.status_refresh_interval, shutdown_rx);

        let api = spawn_api(config, coordinator.clone(), registry).await?;
        info!(address = %api.local_addr(), "api server listening");

        Ok(Self {
            coordinator,
            api,
            status_loop,
            mirror_task,
            shutdown,
        })
    }

    async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.status_loop.await {
            warn!(error = %err, "status loop task failed");
        }
        self.api.shutdown().await?;
        drop(self.coordinator);
        // websocket sessions may still hold mirror handles
        self.mirror_task.abort();
        Ok(())
    }
}

async fn spawn_api(
    config: &AppConfig,
    coordinator: Arc<Coordinator>,
    registry: Option<SharedRegistry>,
) -> Result<RestApiHandle> {
    let mut builder = RestApiBuilder::for_coordinator(config.api.listen, coordinator);
    if let Some(registry) = registry {
        builder = builder.with_metrics_registry(registry);
    }
    builder
        .spawn()
        .await
        .with_context(|| format!("failed to bind api on {}", config.api.listen))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/vsubd.toml"));
    candidates.push(PathBuf::from("configs/vsubd.example.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    if let Some(url) = cli.telemetry_url {
        config.device.telemetry_url = url;
    }
    if let Some(url) = cli.command_url {
        config.device.command_url = url;
    }
    config.validate()?;

    init_tracing("vsubd", &config.logging)?;
    info!(
        config_path = %loaded.source.display(),
        telemetry_url = %config.device.telemetry_url,
        command_url = %config.device.command_url,
        "configuration loaded"
    );

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            serve(&config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::RunTests => run_tests(&config).await,
    }
}

async fn serve(config: &AppConfig) -> Result<()> {
    let runtime = Runtime::start(config).await?;
    info!("coordinator running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    runtime.stop().await
}

async fn run_tests(config: &AppConfig) -> Result<ExitCode> {
    // the device polls setpoints from our API, so it has to be up for the run
    let runtime = Runtime::start(config).await?;
    let outcome = runtime.coordinator.run_battery().await;
    runtime.stop().await?;

    match outcome {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.ok {
                Ok(ExitCode::SUCCESS)
            } else {
                warn!(failed = report.failed_steps().count(), "test battery failed");
                Ok(ExitCode::FAILURE)
            }
        }
        Err(err) => {
            error!(error = %err, kind = err.kind(), "test battery aborted");
            println!(
                "{}",
                serde_json::json!({ "ok": false, "error": err.to_string(), "kind": "run_fault" })
            );
            Ok(ExitCode::from(2))
        }
    }
}
