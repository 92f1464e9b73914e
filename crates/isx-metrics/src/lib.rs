// SPDX-License-Identifier: MIT OR Apache-2.0
//! Durable store of per-stage completion samples, used to seed the
//! progress calculator's historical ETA estimate across process restarts.
//!
//! Storage format: one newline-delimited JSON file per stage id, named
//! `<stage_id>.ndjson`, inside a root directory. Each write reads the
//! current file, appends the new record in memory, and replaces the file
//! atomically (write to a sibling `.tmp` file, then rename) so a crash
//! mid-write never leaves a partial trailing line. A corrupted line
//! encountered on read is skipped and logged rather than failing the
//! whole query.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use isx_core::HistoricalSample;
use isx_error::{ErrorCode, PipelineError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Append-only, per-stage-id NDJSON store for [`HistoricalSample`] records.
pub struct MetricsStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MetricsStore {
    /// Open a store rooted at `root`, creating the directory if absent.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            PipelineError::new(
                ErrorCode::SystemFailure,
                format!("failed to create metrics directory {}", root.display()),
            )
            .with_source(e)
        })?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    fn path_for(&self, stage_id: &str) -> PathBuf {
        self.root.join(format!("{stage_id}.ndjson"))
    }

    async fn lock_for(&self, stage_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(stage_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Append a completion sample for `sample.stage_id`, atomically
    /// replacing that stage's NDJSON file.
    pub async fn record(&self, sample: HistoricalSample) -> Result<(), PipelineError> {
        let stage_lock = self.lock_for(&sample.stage_id).await;
        let _guard = stage_lock.lock().await;

        let path = self.path_for(&sample.stage_id);
        let mut body = read_existing(&path).await?;
        let line = serde_json::to_string(&sample).map_err(|e| {
            PipelineError::new(ErrorCode::SystemFailure, "failed to serialize metrics sample")
                .with_stage(sample.stage_id.clone())
                .with_source(e)
        })?;
        body.push_str(&line);
        body.push('\n');

        let tmp_path = path.with_extension("ndjson.tmp");
        tokio::fs::write(&tmp_path, body).await.map_err(|e| {
            PipelineError::new(
                ErrorCode::SystemFailure,
                format!("failed to write {}", tmp_path.display()),
            )
            .with_stage(sample.stage_id.clone())
            .with_source(e)
        })?;
        tokio::fs::rename(&tmp_path, &path).await.map_err(|e| {
            PipelineError::new(
                ErrorCode::SystemFailure,
                format!("failed to replace {}", path.display()),
            )
            .with_stage(sample.stage_id.clone())
            .with_source(e)
        })?;
        Ok(())
    }

    /// All samples on disk for `stage_id`, oldest first, skipping and
    /// logging any line that fails to parse.
    pub async fn samples(&self, stage_id: &str) -> Result<Vec<HistoricalSample>, PipelineError> {
        let stage_lock = self.lock_for(stage_id).await;
        let _guard = stage_lock.lock().await;
        read_samples(&self.path_for(stage_id)).await
    }

    /// The `k` most recent samples for `stage_id`, newest first.
    pub async fn last(&self, stage_id: &str, k: usize) -> Result<Vec<HistoricalSample>, PipelineError> {
        let mut all = self.samples(stage_id).await?;
        all.reverse();
        all.truncate(k);
        Ok(all)
    }

    /// Samples for `stage_id` started within the last `window_days` days,
    /// relative to `now`.
    pub async fn samples_within(
        &self,
        stage_id: &str,
        window_days: i64,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<HistoricalSample>, PipelineError> {
        let cutoff = now - chrono::Duration::days(window_days);
        let all = self.samples(stage_id).await?;
        Ok(all.into_iter().filter(|s| s.started_at >= cutoff).collect())
    }

    /// Median duration across all on-disk samples for `stage_id`, or
    /// `None` if there are no samples.
    pub async fn median(&self, stage_id: &str) -> Result<Option<std::time::Duration>, PipelineError> {
        let mut durations: Vec<u64> = self
            .samples(stage_id)
            .await?
            .into_iter()
            .map(|s| s.duration_ns)
            .collect();
        if durations.is_empty() {
            return Ok(None);
        }
        durations.sort_unstable();
        let mid = durations.len() / 2;
        let median_ns = if durations.len() % 2 == 0 {
            (durations[mid - 1] + durations[mid]) / 2
        } else {
            durations[mid]
        };
        Ok(Some(std::time::Duration::from_nanos(median_ns)))
    }
}

async fn read_existing(path: &Path) -> Result<String, PipelineError> {
    match tokio::fs::read_to_string(path).await {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(PipelineError::new(
            ErrorCode::SystemFailure,
            format!("failed to read {}", path.display()),
        )
        .with_source(e)),
    }
}

async fn read_samples(path: &Path) -> Result<Vec<HistoricalSample>, PipelineError> {
    let body = match tokio::fs::read_to_string(path).await {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(PipelineError::new(
                ErrorCode::SystemFailure,
                format!("failed to read {}", path.display()),
            )
            .with_source(e));
        }
    };

    let mut samples = Vec::new();
    for (lineno, line) in body.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<HistoricalSample>(line) {
            Ok(sample) => samples.push(sample),
            Err(e) => {
                tracing::warn!(
                    target: "isx.metrics",
                    path = %path.display(),
                    line = lineno + 1,
                    error = %e,
                    "skipping corrupted metrics record"
                );
            }
        }
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(stage_id: &str, duration_ns: u64) -> HistoricalSample {
        HistoricalSample {
            schema_version: HistoricalSample::current_schema_version(),
            stage_id: stage_id.to_string(),
            duration_ns,
            started_at: Utc::now(),
            n_units: None,
        }
    }

    #[tokio::test]
    async fn round_trips_a_single_sample() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetricsStore::new(dir.path()).await.unwrap();
        store.record(sample("scrape", 1_000_000_000)).await.unwrap();
        let samples = store.samples("scrape").await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].duration_ns, 1_000_000_000);
    }

    #[tokio::test]
    async fn unknown_stage_id_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetricsStore::new(dir.path()).await.unwrap();
        assert!(store.samples("never-seen").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn median_of_three_samples_is_the_middle_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetricsStore::new(dir.path()).await.unwrap();
        for ns in [3_000_000_000u64, 1_000_000_000, 2_000_000_000] {
            store.record(sample("process", ns)).await.unwrap();
        }
        let median = store.median("process").await.unwrap().unwrap();
        assert_eq!(median, std::time::Duration::from_secs(2));
    }

    #[tokio::test]
    async fn last_k_returns_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetricsStore::new(dir.path()).await.unwrap();
        for ns in [1, 2, 3] {
            store.record(sample("index_csv", ns)).await.unwrap();
        }
        let last_two = store.last("index_csv", 2).await.unwrap();
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[0].duration_ns, 3);
        assert_eq!(last_two[1].duration_ns, 2);
    }

    #[tokio::test]
    async fn corrupted_line_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetricsStore::new(dir.path()).await.unwrap();
        store.record(sample("analysis", 500)).await.unwrap();
        let path = dir.path().join("analysis.ndjson");
        let mut body = tokio::fs::read_to_string(&path).await.unwrap();
        body.push_str("{not valid json\n");
        tokio::fs::write(&path, body).await.unwrap();

        let samples = store.samples("analysis").await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].duration_ns, 500);
    }

    #[tokio::test]
    async fn concurrent_writes_to_same_stage_do_not_lose_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MetricsStore::new(dir.path()).await.unwrap());
        let mut handles = Vec::new();
        for i in 0..20u64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.record(sample("scrape", i)).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let samples = store.samples("scrape").await.unwrap();
        assert_eq!(samples.len(), 20);
    }
}
