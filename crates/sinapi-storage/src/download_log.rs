use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sinapi_core::{ArchiveFormat, ReferencePeriod};
use tokio::fs;
use tracing::warn;

pub const DOWNLOAD_LOG_FILE: &str = "download_log.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadOutcome {
    Downloaded,
    NotPublished,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadLogEntry {
    pub attempted_at: DateTime<Utc>,
    pub outcome: DownloadOutcome,
    #[serde(default)]
    pub sha256: Option<String>,
}

/// Last acquisition attempt per `<year>_<month>_<format>`, persisted as JSON.
#[derive(Debug, Clone, Default)]
pub struct DownloadLog {
    path: PathBuf,
    entries: BTreeMap<String, DownloadLogEntry>,
}

impl DownloadLog {
    pub fn key(period: ReferencePeriod, format: ArchiveFormat) -> String {
        format!("{:04}_{:02}_{}", period.year, period.month, format.as_str())
    }

    /// Loads the log at `path`; a missing or unreadable log starts empty.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match fs::read_to_string(&path).await {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|err| {
                warn!(path = %path.display(), error = %err, "ignoring unreadable download log");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Self { path, entries }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&DownloadLogEntry> {
        self.entries.get(key)
    }

    /// Time left in the cool-down window for `key`, if an attempt is that recent.
    pub fn cooldown_remaining(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Option<Duration> {
        let entry = self.entries.get(key)?;
        let elapsed = now - entry.attempted_at;
        if elapsed < window {
            Some(window - elapsed)
        } else {
            None
        }
    }

    pub fn record(&mut self, key: String, entry: DownloadLogEntry) {
        self.entries.insert(key, entry);
    }

    pub async fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let bytes = serde_json::to_vec_pretty(&self.entries).context("serializing download log")?;
        let temp = self.path.with_extension("json.tmp");
        fs::write(&temp, bytes)
            .await
            .with_context(|| format!("writing {}", temp.display()))?;
        fs::rename(&temp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}
