use sinapi_relations::RelationError;
use sinapi_storage::{AcquireError, ExtractError};
use thiserror::Error;

use crate::config::ConfigError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Relations(#[from] RelationError),
    #[error("workbook parsing task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Every failure a run can end with. The orchestrator converts these into a
/// `RunResult`; none of them escapes `Pipeline::run`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("download error: {0}")]
    Download(#[source] AcquireError),
    #[error("processing error: {0}")]
    Processing(#[from] ProcessingError),
    #[error("database error: {0}")]
    Database(#[from] StoreError),
    #[error("input error: {0}")]
    Input(#[source] AcquireError),
    #[error("run interrupted")]
    Interrupted,
}

impl PipelineError {
    /// Whether re-running the whole pipeline later can succeed without any
    /// change to inputs or configuration.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Download(_) | Self::Database(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "ConfigurationError",
            Self::Download(_) => "DownloadError",
            Self::Processing(_) => "ProcessingError",
            Self::Database(_) => "DatabaseError",
            Self::Input(_) => "InputError",
            Self::Interrupted => "Interrupted",
        }
    }
}

impl From<AcquireError> for PipelineError {
    fn from(err: AcquireError) -> Self {
        if err.is_input_error() {
            Self::Input(err)
        } else {
            Self::Download(err)
        }
    }
}

impl From<ExtractError> for PipelineError {
    fn from(err: ExtractError) -> Self {
        Self::Processing(err.into())
    }
}

impl From<RelationError> for PipelineError {
    fn from(err: RelationError) -> Self {
        Self::Processing(err.into())
    }
}
