//! Source archive acquisition: HTTP fetch with retry + proxy fallback, atomic
//! on-disk archive storage, download cool-down log and archive extraction.

use std::path::{Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

mod acquire;
mod download_log;
mod extract;
mod fetch;
mod proxy;

pub use acquire::{
    period_download_dir, AcquireConfig, AcquireError, AcquireRequest, Acquired, Acquirer,
    DEFAULT_BASE_URL, LOCAL_FILE_EXTENSIONS,
};
pub use download_log::{DownloadLog, DownloadLogEntry, DownloadOutcome, DOWNLOAD_LOG_FILE};
pub use extract::{extraction_dir_for, ArchiveExtractor, ExtractError};
pub use fetch::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, HttpClientConfig,
    HttpFetcher, RetryDisposition,
};
pub use proxy::{parse_proxy_list, ProxySource, PublicListProxySource, StaticProxySource};

pub const CRATE_NAME: &str = "sinapi-storage";

#[derive(Debug, Clone)]
pub struct StoredArchive {
    pub path: PathBuf,
    pub sha256: String,
    pub byte_size: usize,
}

/// Writes downloaded archives into a directory without ever exposing a
/// partially written file under the final name.
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    root: PathBuf,
}

impl ArchiveStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Store bytes under `file_name` using a temp file + atomic rename.
    pub async fn store_bytes(&self, file_name: &str, bytes: &[u8]) -> anyhow::Result<StoredArchive> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating archive directory {}", self.root.display()))?;

        let sha256 = Self::sha256_hex(bytes);
        let final_path = self.root.join(file_name);
        let temp_path = self
            .root
            .join(format!(".{}.{}.part", Uuid::new_v4(), bytes.len()));

        let write_result = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await
                .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
            file.write_all(bytes)
                .await
                .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
            file.sync_all()
                .await
                .with_context(|| format!("syncing temp archive file {}", temp_path.display()))?;
            drop(file);
            fs::rename(&temp_path, &final_path).await.with_context(|| {
                format!(
                    "atomically renaming temp archive {} -> {}",
                    temp_path.display(),
                    final_path.display()
                )
            })
        }
        .await;

        if let Err(err) = write_result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        Ok(StoredArchive {
            path: final_path,
            sha256,
            byte_size: bytes.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn archive_hashing_is_stable() {
        let hash = ArchiveStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn store_leaves_only_the_final_file() {
        let dir = tempdir().expect("tempdir");
        let store = ArchiveStore::new(dir.path().join("2025_08"));

        let stored = store
            .store_bytes("SINAPI-2025-08-formato-xlsx.zip", b"PK\x03\x04payload")
            .await
            .expect("store");

        assert!(stored.path.exists());
        assert_eq!(stored.byte_size, 11);
        let names: Vec<_> = std::fs::read_dir(store.root())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["SINAPI-2025-08-formato-xlsx.zip".to_string()]);
    }
}
