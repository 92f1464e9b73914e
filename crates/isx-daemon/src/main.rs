// SPDX-License-Identifier: MIT OR Apache-2.0
//! Binary entry point: loads configuration, wires the orchestrator, and
//! serves the HTTP control plane.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use isx_daemon::middleware::{AlwaysValid, LicenseGate};
use isx_daemon::{build_app, AppState};
use isx_runtime::{EventBroadcaster, Manager, ManagerConfig};
use isx_stages::{AnalysisStage, IndexCsvStage, ProcessStage, ScrapeStage};
use isx_telemetry::LogFormat;
use tracing::info;

/// ISX pipeline orchestration daemon.
#[derive(Debug, Parser)]
#[command(name = "isx-pipelined", version)]
struct Cli {
    /// Path to a TOML configuration file; falls back to built-in defaults
    /// (then environment overrides) when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured bind address (`PIPELINE_BIND_ADDR` takes
    /// precedence if both are set).
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = isx_config::load_config(cli.config.as_deref())?;
    isx_config::apply_env_overrides(&mut config);
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    let warnings = isx_config::validate_config(&config)?;

    let log_format: LogFormat = config.log_format.parse().unwrap_or(LogFormat::Pretty);
    isx_telemetry::init_tracing(log_format, &config.log_level);

    for warning in &warnings {
        tracing::warn!(%warning, "configuration warning");
    }

    let mut stage_timeouts = std::collections::BTreeMap::new();
    for (stage_id, ms) in &config.stage_timeouts_ms {
        stage_timeouts.insert(stage_id.clone(), Duration::from_millis(*ms));
    }
    let manager_config = ManagerConfig {
        default_stage_timeout: Duration::from_millis(config.default_stage_timeout_ms),
        stage_timeouts,
        retry_policy: isx_retry::RetryPolicy::builder().max_attempts(config.max_retries).build(),
        history_limit: 16,
    };

    let metrics = Arc::new(isx_metrics::MetricsStore::new(config.metrics_dir.clone()).await?);
    let broadcaster = Arc::new(EventBroadcaster::new());
    let mut manager = Manager::new(Arc::clone(&broadcaster), metrics, manager_config);
    manager.register_stage(ScrapeStage::default())?;
    manager.register_stage(ProcessStage::default())?;
    manager.register_stage(IndexCsvStage::default())?;
    manager.register_stage(AnalysisStage::default())?;

    let state = AppState {
        manager: Arc::new(manager),
    };

    let license_gate = LicenseGate::new(
        Arc::new(AlwaysValid),
        Duration::from_millis(config.license_cache_ttl_ms),
        Duration::from_millis(config.license_validation_timeout_ms),
        config.license_exempt_paths.clone(),
    )
    .into_layer();

    let app = build_app(state, license_gate);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(bind_addr = %config.bind_addr, "isx-pipelined listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
