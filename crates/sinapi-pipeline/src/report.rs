use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

use crate::pipeline::RunResult;

pub const RUN_RESULT_FILE: &str = "run_result.json";

/// Writes `<reports_dir>/<run_id>/run_result.json`; returns the run's report directory.
pub async fn write_run_report(reports_dir: &Path, result: &RunResult) -> Result<PathBuf> {
    let run_dir = reports_dir.join(result.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let bytes = serde_json::to_vec_pretty(result).context("serializing run result")?;
    fs::write(run_dir.join(RUN_RESULT_FILE), bytes)
        .await
        .with_context(|| format!("writing {RUN_RESULT_FILE}"))?;
    Ok(run_dir)
}

/// Markdown digest of the `runs` most recent run reports, newest first.
pub fn recent_runs_markdown(reports_dir: &Path, runs: usize) -> Result<String> {
    let entries = std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?;

    let mut results = Vec::new();
    for entry in entries.filter_map(|entry| entry.ok()) {
        let path = entry.path().join(RUN_RESULT_FILE);
        if !path.is_file() {
            continue;
        }
        let result: RunResult = serde_json::from_str(
            &std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?,
        )
        .with_context(|| format!("parsing {}", path.display()))?;
        results.push(result);
    }
    results.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    let mut lines = vec!["# SINAPI load runs".to_string(), String::new()];
    if results.is_empty() {
        lines.push("No runs recorded.".to_string());
    }
    for result in results.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}`", result.run_id));
        lines.push(format!("- status: {}", result.status));
        if let Some(period) = result.period {
            lines.push(format!("- period: {period}"));
        }
        lines.push(format!("- started: {}", result.started_at));
        lines.push(format!("- records inserted: {}", result.records_inserted));
        if !result.tables_updated.is_empty() {
            let tables: Vec<&str> = result.tables_updated.iter().map(String::as_str).collect();
            lines.push(format!("- tables: {}", tables.join(", ")));
        }
        if let Some(kind) = &result.error_kind {
            lines.push(format!("- error: {kind}: {}", result.message));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use sinapi_core::RunStatus;
    use std::collections::BTreeSet;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn result(status: RunStatus, minutes_ago: i64) -> RunResult {
        let started_at = Utc::now() - Duration::minutes(minutes_ago);
        RunResult {
            run_id: Uuid::new_v4(),
            status,
            message: "done".into(),
            period: None,
            tables_updated: BTreeSet::from(["input_items".to_string()]),
            records_inserted: 12,
            started_at,
            finished_at: started_at,
            error_kind: None,
            failed_phase: None,
            retryable: false,
        }
    }

    #[tokio::test]
    async fn report_lands_in_the_run_directory() {
        let dir = tempdir().unwrap();
        let run = result(RunStatus::Success, 0);
        let run_dir = write_run_report(dir.path(), &run).await.unwrap();

        assert_eq!(run_dir, dir.path().join(run.run_id.to_string()));
        let parsed: RunResult =
            serde_json::from_slice(&std::fs::read(run_dir.join(RUN_RESULT_FILE)).unwrap()).unwrap();
        assert_eq!(parsed, run);
    }

    #[tokio::test]
    async fn digest_lists_newest_runs_first() {
        let dir = tempdir().unwrap();
        let older = result(RunStatus::Failure, 60);
        let newer = result(RunStatus::SuccessNoData, 1);
        write_run_report(dir.path(), &older).await.unwrap();
        write_run_report(dir.path(), &newer).await.unwrap();
        std::fs::create_dir(dir.path().join("stray")).unwrap();

        let markdown = recent_runs_markdown(dir.path(), 1).unwrap();
        assert!(markdown.contains(&newer.run_id.to_string()));
        assert!(markdown.contains("SUCCESS_NO_DATA"));
        assert!(!markdown.contains(&older.run_id.to_string()));
    }
}
