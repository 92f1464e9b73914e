// SPDX-License-Identifier: MIT OR Apache-2.0
//! Concrete [`isx_core::Stage`] bodies: thin invocation shims that shell out
//! to the `scrape`/`process`/`indexcsv`/`analysis` CLI helpers, stream their
//! stdout/stderr into the handle's log, and map exit codes onto the error
//! taxonomy. All business logic (scraping, Excel/CSV parsing, chart
//! rendering) lives in the external helper, not here.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod runner;

use async_trait::async_trait;
use isx_core::{CancellationToken, PipelineState, Stage, StageHandle};
use isx_error::{ErrorCode, PipelineError};
use tokio::process::Command;

async fn context_str(handle: &StageHandle, key: &str, stage_id: &str) -> Result<String, PipelineError> {
    match handle.read(key).await {
        Some(serde_json::Value::String(s)) => Ok(s),
        Some(other) => Ok(other.to_string().trim_matches('"').to_string()),
        None => Err(PipelineError::new(
            ErrorCode::ValidationFailed,
            format!("missing required context key '{key}'"),
        )
        .with_stage(stage_id.to_string())),
    }
}

/// Shells out to the `scrape` CLI helper to download raw ISX daily reports.
///
/// Writes into `download_dir` by running the helper with that directory as
/// its working directory: the documented CLI surface for `scrape` takes no
/// explicit output-directory flag.
pub struct ScrapeStage {
    command: String,
}

impl ScrapeStage {
    /// Construct with a non-default CLI executable name (for testing).
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self { command: command.into() }
    }
}

impl Default for ScrapeStage {
    fn default() -> Self {
        Self::new("scrape")
    }
}

#[async_trait]
impl Stage for ScrapeStage {
    fn id(&self) -> &str {
        "scrape"
    }

    fn name(&self) -> &str {
        "Scrape ISX daily reports"
    }

    fn dependencies(&self) -> &[String] {
        &[]
    }

    async fn execute(&self, cancel: CancellationToken, handle: StageHandle) -> Result<(), PipelineError> {
        let mode = context_str(&handle, "mode", self.id()).await?;
        let from_date = context_str(&handle, "from_date", self.id()).await?;
        let to_date = context_str(&handle, "to_date", self.id()).await?;
        let download_dir = context_str(&handle, "download_dir", self.id()).await?;

        let mut cmd = Command::new(&self.command);
        cmd.current_dir(&download_dir)
            .arg(format!("--mode={mode}"))
            .arg(format!("--from={from_date}"))
            .arg(format!("--to={to_date}"))
            .arg("--headless=true");

        runner::run_command(self.id(), cmd, &handle, &cancel).await
    }
}

/// Shells out to the `process` CLI helper to transform raw downloads into
/// normalized per-ticker CSV/JSON reports.
pub struct ProcessStage {
    command: String,
    dependencies: Vec<String>,
}

impl ProcessStage {
    /// Construct with a non-default CLI executable name (for testing).
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            dependencies: vec!["scrape".to_string()],
        }
    }
}

impl Default for ProcessStage {
    fn default() -> Self {
        Self::new("process")
    }
}

#[async_trait]
impl Stage for ProcessStage {
    fn id(&self) -> &str {
        "process"
    }

    fn name(&self) -> &str {
        "Derive normalized reports"
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    async fn execute(&self, cancel: CancellationToken, handle: StageHandle) -> Result<(), PipelineError> {
        let download_dir = context_str(&handle, "download_dir", self.id()).await?;
        let report_dir = context_str(&handle, "report_dir", self.id()).await?;

        let mut cmd = Command::new(&self.command);
        cmd.arg(format!("--in={download_dir}")).arg(format!("--out={report_dir}"));

        runner::run_command(self.id(), cmd, &handle, &cancel).await
    }
}

/// Shells out to the `indexcsv` CLI helper to build the combined ticker
/// index file consumed by the dashboard.
pub struct IndexCsvStage {
    command: String,
    dependencies: Vec<String>,
}

impl IndexCsvStage {
    /// Construct with a non-default CLI executable name (for testing).
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            dependencies: vec!["process".to_string()],
        }
    }
}

impl Default for IndexCsvStage {
    fn default() -> Self {
        Self::new("indexcsv")
    }
}

#[async_trait]
impl Stage for IndexCsvStage {
    fn id(&self) -> &str {
        "indexcsv"
    }

    fn name(&self) -> &str {
        "Build ticker index"
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    async fn execute(&self, cancel: CancellationToken, handle: StageHandle) -> Result<(), PipelineError> {
        let report_dir = context_str(&handle, "report_dir", self.id()).await?;
        let out_file = format!("{report_dir}/index.csv");

        let mut cmd = Command::new(&self.command);
        cmd.arg(format!("--dir={report_dir}")).arg(format!("--out={out_file}"));

        runner::run_command(self.id(), cmd, &handle, &cancel).await
    }
}

/// Shells out to the `analysis` CLI helper to render charts/summaries from
/// the indexed reports.
///
/// The CLI surface for this helper is not externally documented the way
/// `scrape`/`process`/`indexcsv` are; it follows the same `--dir`/`--out`
/// convention as `indexcsv` by analogy.
pub struct AnalysisStage {
    command: String,
    dependencies: Vec<String>,
}

impl AnalysisStage {
    /// Construct with a non-default CLI executable name (for testing).
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            dependencies: vec!["indexcsv".to_string()],
        }
    }
}

impl Default for AnalysisStage {
    fn default() -> Self {
        Self::new("analysis")
    }
}

#[async_trait]
impl Stage for AnalysisStage {
    fn id(&self) -> &str {
        "analysis"
    }

    fn name(&self) -> &str {
        "Render analysis charts and summaries"
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    async fn validate(&self, state: &PipelineState) -> Result<(), PipelineError> {
        if state.stage("indexcsv").is_none() {
            return Err(PipelineError::new(
                ErrorCode::DependencyMissing,
                "analysis requires the indexcsv stage to be registered",
            )
            .with_stage(self.id().to_string()));
        }
        Ok(())
    }

    async fn execute(&self, cancel: CancellationToken, handle: StageHandle) -> Result<(), PipelineError> {
        let report_dir = context_str(&handle, "report_dir", self.id()).await?;
        let out_file = format!("{report_dir}/analysis.json");

        let mut cmd = Command::new(&self.command);
        cmd.arg(format!("--dir={report_dir}")).arg(format!("--out={out_file}"));

        runner::run_command(self.id(), cmd, &handle, &cancel).await
    }
}
