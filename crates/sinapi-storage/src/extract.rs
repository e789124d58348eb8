use std::fs::File;
use std::path::{Path, PathBuf};

use sinapi_core::RunContext;
use thiserror::Error;
use tracing::{info, Instrument};

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("archive {} is corrupt or not a zip file: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("extraction task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// `<parent>/<stem>` of the archive, so re-running on the same file lands in
/// the same place.
pub fn extraction_dir_for(archive: &Path) -> PathBuf {
    let stem = archive
        .file_stem()
        .map(|s| s.to_os_string())
        .unwrap_or_else(|| "extracted".into());
    archive
        .parent()
        .map(|p| p.join(&stem))
        .unwrap_or_else(|| PathBuf::from(stem))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveExtractor;

impl ArchiveExtractor {
    /// Unpacks a `.zip` into its extraction directory. Any other file is a
    /// single workbook and is copied there instead, so downstream discovery
    /// always scans a directory.
    pub async fn extract(&self, ctx: &RunContext, source: &Path) -> Result<PathBuf, ExtractError> {
        let source = source.to_path_buf();
        async move {
            let target = extraction_dir_for(&source);
            let is_zip = source
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("zip"));

            let task_target = target.clone();
            let task_source = source.clone();
            let entries = tokio::task::spawn_blocking(move || {
                if is_zip {
                    unzip(&task_source, &task_target)
                } else {
                    copy_single(&task_source, &task_target)
                }
            })
            .await??;

            info!(
                source = %source.display(),
                target = %target.display(),
                entries,
                "source extracted"
            );
            Ok(target)
        }
        .instrument(ctx.span().clone())
        .await
    }
}

fn create_dir(target: &Path) -> Result<(), ExtractError> {
    std::fs::create_dir_all(target).map_err(|source| ExtractError::Io {
        path: target.to_path_buf(),
        source,
    })
}

fn unzip(archive_path: &Path, target: &Path) -> Result<usize, ExtractError> {
    let file = File::open(archive_path).map_err(|source| ExtractError::Io {
        path: archive_path.to_path_buf(),
        source,
    })?;
    let corrupt = |source| ExtractError::Corrupt {
        path: archive_path.to_path_buf(),
        source,
    };
    let mut archive = zip::ZipArchive::new(file).map_err(corrupt)?;
    create_dir(target)?;
    let entries = archive.len();
    archive.extract(target).map_err(corrupt)?;
    Ok(entries)
}

fn copy_single(source: &Path, target: &Path) -> Result<usize, ExtractError> {
    create_dir(target)?;
    let Some(name) = source.file_name() else {
        return Err(ExtractError::Io {
            path: source.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name"),
        });
    };
    let dest = target.join(name);
    std::fs::copy(source, &dest).map_err(|source| ExtractError::Io { path: dest, source })?;
    Ok(1)
}
