// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared subprocess-invocation plumbing for the concrete stage bodies.

use std::process::Stdio;

use isx_core::{CancellationToken, LogLevel, StageHandle};
use isx_error::{ErrorCode, PipelineError};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

/// Spawn `cmd`, stream its stdout/stderr into `handle.log`, and wait for
/// exit while honoring cooperative cancellation.
///
/// Exit code 0 is the sole success signal (per the CLI surface contract):
/// spawn failures map to `ExecutionFatal` (the helper is missing or
/// unrunnable), non-zero exits map to `ExecutionRetryable` (the external
/// process may have hit a transient condition, e.g. a network hiccup
/// during scraping), and cancellation while the child is still running
/// kills it and returns `Cancelled`.
pub(crate) async fn run_command(
    stage_id: &str,
    mut cmd: Command,
    handle: &StageHandle,
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    handle.progress(0, format!("starting {stage_id}"));

    let mut child = cmd.spawn().map_err(|e| {
        PipelineError::new(ErrorCode::ExecutionFatal, format!("failed to spawn {stage_id}: {e}"))
            .with_stage(stage_id.to_string())
            .with_hint(format!("verify the '{stage_id}' CLI helper is installed and on PATH"))
    })?;

    let stdout = child.stdout.take().expect("stdout piped by run_command");
    let stderr = child.stderr.take().expect("stderr piped by run_command");

    let stdout_handle = handle.clone();
    let stdout_task = tokio::spawn(async move {
        stream_lines(stdout, &stdout_handle, LogLevel::Info).await;
    });
    let stderr_handle = handle.clone();
    let stderr_task = tokio::spawn(async move {
        stream_lines(stderr, &stderr_handle, LogLevel::Warn).await;
    });

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            return Err(
                PipelineError::new(ErrorCode::Cancelled, format!("{stage_id} cancelled"))
                    .with_stage(stage_id.to_string()),
            );
        }
        status = child.wait() => status,
    };

    let _ = stdout_task.await;
    let _ = stderr_task.await;

    let status = status.map_err(|e| {
        PipelineError::new(ErrorCode::ExecutionFatal, format!("failed to wait on {stage_id}: {e}"))
            .with_stage(stage_id.to_string())
    })?;

    if !status.success() {
        return Err(PipelineError::new(
            ErrorCode::ExecutionRetryable,
            format!("{stage_id} exited with {status}"),
        )
        .with_stage(stage_id.to_string())
        .with_hint("check the CLI helper's stderr output above for the underlying cause"));
    }

    handle.progress(100, format!("{stage_id} completed"));
    Ok(())
}

async fn stream_lines(io: impl AsyncRead + Unpin, handle: &StageHandle, level: LogLevel) {
    let mut reader = BufReader::new(io);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim_end();
                if !trimmed.is_empty() {
                    handle.log(level, trimmed.to_string());
                }
            }
            Err(_) => break,
        }
    }
}
