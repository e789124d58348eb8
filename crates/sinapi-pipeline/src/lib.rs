//! Monthly load orchestration: reconciliation, relational load policies,
//! status synchronization and the phase sequencer that drives them.

mod config;
mod error;
mod pipeline;
mod reconcile;
mod report;
mod scheduler;
mod status;
pub mod store;

pub use config::{period_from, ConfigError, DbConfig, PipelineConfig, SchemaMode};
pub use error::{PipelineError, ProcessingError, Result};
pub use pipeline::{Phase, Pipeline, RunResult};
pub use reconcile::{split_synthesized, PlaceholderTemplates, ReconcileSummary, Reconciler};
pub use report::{recent_runs_markdown, write_run_report, RUN_RESULT_FILE};
pub use scheduler::{current_period, maybe_build_scheduler};
pub use status::{derive_deactivated, matches_deactivation, StatusSyncReport, StatusSynchronizer};
pub use store::{PgStore, RelationalStore, Rows, StoreError, Table, WritePolicy};

pub const CRATE_NAME: &str = "sinapi-pipeline";

/// Builds the Postgres-backed pipeline described by `config`.
pub async fn pipeline_from_config(config: PipelineConfig) -> Result<Pipeline> {
    config.validate_settings()?;
    let store = PgStore::connect(&config.database).await?;
    Pipeline::new(config, std::sync::Arc::new(store))
}
