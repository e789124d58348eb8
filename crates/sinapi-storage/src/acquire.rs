use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{Duration, Utc};
use rand::seq::SliceRandom;
use sinapi_core::{archive_file_name, source_url, ArchiveFormat, ReferencePeriod, RunContext, SourceType};
use thiserror::Error;
use tracing::{info, warn, Instrument};

use crate::download_log::{DownloadLog, DownloadLogEntry, DownloadOutcome, DOWNLOAD_LOG_FILE};
use crate::fetch::{FetchError, HttpFetcher};
use crate::proxy::ProxySource;
use crate::ArchiveStore;

pub const DEFAULT_BASE_URL: &str = "https://www.caixa.gov.br/Downloads/sinapi-a-vista-composicoes";

/// Extensions accepted for a user-supplied local file.
pub const LOCAL_FILE_EXTENSIONS: &[&str] = &["zip", "xlsx", "xls", "json"];

#[derive(Debug, Clone)]
pub struct AcquireConfig {
    pub base_url: String,
    pub format: ArchiveFormat,
    pub proxy_max_attempts: usize,
    pub cooldown: Duration,
}

impl Default for AcquireConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            format: ArchiveFormat::Xlsx,
            proxy_max_attempts: 10,
            cooldown: Duration::minutes(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AcquireRequest {
    pub period: ReferencePeriod,
    pub source_type: SourceType,
    pub target_dir: PathBuf,
    pub local_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquired {
    Local(PathBuf),
    Cached(PathBuf),
    Downloaded {
        path: PathBuf,
        sha256: String,
        via_proxy: Option<String>,
    },
}

impl Acquired {
    pub fn path(&self) -> &Path {
        match self {
            Self::Local(path) | Self::Cached(path) => path,
            Self::Downloaded { path, .. } => path,
        }
    }
}

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("local file {} does not exist", .0.display())]
    LocalFileMissing(PathBuf),
    #[error("local file {} has an unsupported extension (expected one of: zip, xlsx, xls, json)", .0.display())]
    LocalFileExtension(PathBuf),
    #[error("{url} is not published yet (http {status})")]
    NotPublished { url: String, status: u16 },
    #[error("download {key} was attempted recently; retry in {retry_after_secs}s")]
    RecentlyAttempted { key: String, retry_after_secs: i64 },
    #[error("download failed ({direct}); {proxy_attempts} proxy attempt(s) also failed")]
    Exhausted { direct: String, proxy_attempts: usize },
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

impl AcquireError {
    /// Problems with the user-supplied file, as opposed to the download path.
    pub fn is_input_error(&self) -> bool {
        matches!(self, Self::LocalFileMissing(_) | Self::LocalFileExtension(_))
    }
}

pub fn period_download_dir(root: &Path, period: ReferencePeriod) -> PathBuf {
    root.join(format!("{:04}_{:02}", period.year, period.month))
}

pub struct Acquirer {
    http: HttpFetcher,
    proxies: Arc<dyn ProxySource>,
    config: AcquireConfig,
}

impl Acquirer {
    pub fn new(http: HttpFetcher, proxies: Arc<dyn ProxySource>, config: AcquireConfig) -> Self {
        Self {
            http,
            proxies,
            config,
        }
    }

    pub fn config(&self) -> &AcquireConfig {
        &self.config
    }

    pub async fn acquire(
        &self,
        ctx: &RunContext,
        request: &AcquireRequest,
    ) -> Result<Acquired, AcquireError> {
        async {
            if let Some(local) = &request.local_file {
                let path = validate_local_file(local)?;
                info!(path = %path.display(), "using local source file");
                return Ok(Acquired::Local(path));
            }

            let file_name = archive_file_name(request.period, self.config.format);
            let target = request.target_dir.join(&file_name);
            let key = DownloadLog::key(request.period, self.config.format);
            let mut log = DownloadLog::load(request.target_dir.join(DOWNLOAD_LOG_FILE)).await;

            if tokio::fs::try_exists(&target).await.unwrap_or(false) {
                let recorded = log.get(&key).and_then(|entry| entry.sha256.as_deref());
                if cached_archive_is_sound(&target, recorded).await {
                    info!(path = %target.display(), "archive already on disk; skipping download");
                    return Ok(Acquired::Cached(target));
                }
                warn!(path = %target.display(), "cached archive is unreadable or differs from its logged digest; discarding");
                tokio::fs::remove_file(&target)
                    .await
                    .with_context(|| format!("removing {}", target.display()))?;
            }
            if let Some(remaining) = log.cooldown_remaining(&key, Utc::now(), self.config.cooldown) {
                warn!(%key, retry_after_secs = remaining.num_seconds(), "download attempted recently");
                return Err(AcquireError::RecentlyAttempted {
                    key,
                    retry_after_secs: remaining.num_seconds(),
                });
            }

            let url = source_url(&self.config.base_url, request.period, request.source_type);
            let result = self.download(ctx, &url).await;

            let (outcome, sha256) = match &result {
                Ok((bytes, _)) => (DownloadOutcome::Downloaded, Some(ArchiveStore::sha256_hex(bytes))),
                Err(AcquireError::NotPublished { .. }) => (DownloadOutcome::NotPublished, None),
                Err(_) => (DownloadOutcome::Failed, None),
            };
            log.record(
                key,
                DownloadLogEntry {
                    attempted_at: Utc::now(),
                    outcome,
                    sha256,
                },
            );
            if let Err(err) = log.save().await {
                warn!(error = %err, "could not persist download log");
            }

            let (bytes, via_proxy) = result?;
            let stored = ArchiveStore::new(&request.target_dir)
                .store_bytes(&file_name, &bytes)
                .await?;
            info!(
                path = %stored.path.display(),
                bytes = stored.byte_size,
                sha256 = %stored.sha256,
                via_proxy = via_proxy.as_deref().unwrap_or("direct"),
                "archive downloaded"
            );
            Ok(Acquired::Downloaded {
                path: stored.path,
                sha256: stored.sha256,
                via_proxy,
            })
        }
        .instrument(ctx.span().clone())
        .await
    }

    async fn download(
        &self,
        ctx: &RunContext,
        url: &str,
    ) -> Result<(Vec<u8>, Option<String>), AcquireError> {
        let direct_error = match self.http.fetch_bytes(ctx.run_id, url).await {
            Ok(bytes) => return Ok((bytes, None)),
            Err(FetchError::NotPublished { url, status }) => {
                return Err(AcquireError::NotPublished { url, status });
            }
            Err(err) => err,
        };

        warn!(error = %direct_error, "direct download exhausted; falling back to proxies");
        let mut proxies = match self.proxies.proxies(&self.http).await {
            Ok(list) => list,
            Err(err) => {
                warn!(error = %err, "could not obtain proxy list");
                Vec::new()
            }
        };
        proxies.shuffle(&mut rand::thread_rng());

        let mut attempts = 0usize;
        for proxy in proxies.into_iter().take(self.config.proxy_max_attempts) {
            attempts += 1;
            match self.http.fetch_via_proxy(&proxy, url).await {
                Ok(bytes) => {
                    info!(%proxy, attempts, "proxy download succeeded");
                    return Ok((bytes, Some(proxy)));
                }
                Err(err) => warn!(%proxy, error = %err, "proxy download failed"),
            }
        }

        Err(AcquireError::Exhausted {
            direct: direct_error.to_string(),
            proxy_attempts: attempts,
        })
    }
}

/// Local file header signature every zip container starts with.
const ZIP_SIGNATURE: &[u8] = b"PK\x03\x04";

/// Reusable when the file starts like a zip container and, if the download log
/// kept a digest for it, still hashes to that digest.
async fn cached_archive_is_sound(path: &Path, recorded_sha256: Option<&str>) -> bool {
    let Ok(bytes) = tokio::fs::read(path).await else {
        return false;
    };
    if !bytes.starts_with(ZIP_SIGNATURE) {
        return false;
    }
    recorded_sha256.map_or(true, |sha| ArchiveStore::sha256_hex(&bytes) == sha)
}

fn validate_local_file(path: &Path) -> Result<PathBuf, AcquireError> {
    if !path.is_file() {
        return Err(AcquireError::LocalFileMissing(path.to_path_buf()));
    }
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if !LOCAL_FILE_EXTENSIONS.contains(&extension.as_str()) {
        return Err(AcquireError::LocalFileExtension(path.to_path_buf()));
    }
    Ok(path.to_path_buf())
}
