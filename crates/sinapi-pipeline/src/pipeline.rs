use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sinapi_core::{ReferencePeriod, RunContext, RunStatus};
use sinapi_relations::{discover_workbooks, extractor_for, ExtractedRelations, RelationError, RelationExtractor};
use sinapi_storage::{
    period_download_dir, AcquireConfig, AcquireRequest, Acquired, Acquirer, ArchiveExtractor, ExtractError,
    HttpFetcher, ProxySource, PublicListProxySource, StaticProxySource,
};
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use crate::config::{ConfigError, PipelineConfig};
use crate::error::{PipelineError, ProcessingError, Result};
use crate::reconcile::{split_synthesized, Reconciler};
use crate::report::write_run_report;
use crate::status::StatusSynchronizer;
use crate::store::{RelationalStore, Rows, Table, WritePolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Init,
    Acquire,
    Extract,
    Parse,
    Reconcile,
    LoadCatalogs,
    LoadStructure,
    LoadFacts,
    SyncStatus,
    Done,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Acquire => "ACQUIRE",
            Self::Extract => "EXTRACT",
            Self::Parse => "PARSE",
            Self::Reconcile => "RECONCILE",
            Self::LoadCatalogs => "LOAD_CATALOGS",
            Self::LoadStructure => "LOAD_STRUCTURE",
            Self::LoadFacts => "LOAD_FACTS",
            Self::SyncStatus => "SYNC_STATUS",
            Self::Done => "DONE",
        }
    }
}

/// The only thing a caller gets back from a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub message: String,
    #[serde(default)]
    pub period: Option<ReferencePeriod>,
    pub tables_updated: BTreeSet<String>,
    pub records_inserted: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<String>,
    #[serde(default)]
    pub retryable: bool,
}

impl RunResult {
    /// Result for a run that never reached (or was cut off during) its phases.
    pub fn failed(
        run_id: Uuid,
        period: Option<ReferencePeriod>,
        started_at: DateTime<Utc>,
        err: &PipelineError,
    ) -> Self {
        Self {
            run_id,
            status: RunStatus::Failure,
            message: err.to_string(),
            period,
            tables_updated: BTreeSet::new(),
            records_inserted: 0,
            started_at,
            finished_at: Utc::now(),
            error_kind: Some(err.kind().to_string()),
            failed_phase: None,
            retryable: err.is_retryable(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

/// What a run accomplished so far; survives a failure so the result can
/// report partially committed phases.
#[derive(Debug)]
struct Progress {
    phase: Phase,
    tables_updated: BTreeSet<String>,
    records_inserted: u64,
}

impl Progress {
    fn new() -> Self {
        Self {
            phase: Phase::Init,
            tables_updated: BTreeSet::new(),
            records_inserted: 0,
        }
    }

    fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        info!(phase = phase.as_str(), "phase started");
    }

    fn record(&mut self, table: Table, written: u64) {
        self.tables_updated.insert(table.name().to_string());
        self.records_inserted += written;
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    acquirer: Acquirer,
    archives: ArchiveExtractor,
    extractor: Option<Arc<dyn RelationExtractor>>,
    store: Arc<dyn RelationalStore>,
    reconciler: Reconciler,
    status: StatusSynchronizer,
}

impl Pipeline {
    /// Wires the default collaborators from `config`: HTTP fetcher, proxy list
    /// (when a list URL is configured) and the extension-based extractor registry.
    pub fn new(config: PipelineConfig, store: Arc<dyn RelationalStore>) -> Result<Self> {
        config.validate_settings()?;
        let http = HttpFetcher::new(config.http_client_config())
            .map_err(|err| ConfigError::Invalid(format!("building http client: {err:#}")))?;
        let proxies: Arc<dyn ProxySource> = match &config.proxy_list_url {
            Some(url) => Arc::new(PublicListProxySource::new(url.clone())),
            None => Arc::new(StaticProxySource::default()),
        };
        Ok(Self::with_components(config, http, proxies, store))
    }

    pub fn with_components(
        config: PipelineConfig,
        http: HttpFetcher,
        proxies: Arc<dyn ProxySource>,
        store: Arc<dyn RelationalStore>,
    ) -> Self {
        let acquirer = Acquirer::new(
            http,
            proxies,
            AcquireConfig {
                base_url: config.base_url.clone(),
                format: config.format,
                proxy_max_attempts: config.proxy_max_attempts,
                cooldown: chrono::Duration::minutes(config.cooldown_minutes),
            },
        );
        Self {
            reconciler: Reconciler::new(config.placeholders.clone()),
            status: StatusSynchronizer::new(config.deactivation_keywords.clone()),
            acquirer,
            archives: ArchiveExtractor,
            extractor: None,
            store,
            config,
        }
    }

    /// Prefers `extractor` for every workbook it supports.
    pub fn with_extractor(mut self, extractor: Arc<dyn RelationExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RelationalStore> {
        &self.store
    }

    pub async fn run(&self) -> RunResult {
        self.run_with_id(Uuid::new_v4()).await
    }

    /// Runs the configured period. Never fails: every error becomes a
    /// `FAILURE` result.
    pub async fn run_with_id(&self, run_id: Uuid) -> RunResult {
        match self.config.validate() {
            Ok(period) => self.run_for_period(run_id, period).await,
            Err(err) => {
                let err = PipelineError::from(err);
                error!(%run_id, kind = err.kind(), error = %err, "run rejected before start");
                let result = RunResult::failed(run_id, None, Utc::now(), &err);
                self.persist_report(&result).await;
                result
            }
        }
    }

    pub async fn run_for_period(&self, run_id: Uuid, period: ReferencePeriod) -> RunResult {
        let ctx = RunContext::with_run_id(run_id, period, self.config.source_type);
        let started_at = Utc::now();
        let mut progress = Progress::new();

        let outcome = self
            .execute(&ctx, &mut progress)
            .instrument(ctx.span().clone())
            .await;
        let result = self.conclude(&ctx, started_at, progress, outcome);
        self.persist_report(&result).await;
        result
    }

    async fn execute(&self, ctx: &RunContext, progress: &mut Progress) -> Result<RunStatus> {
        progress.enter(Phase::Init);
        self.store.prepare_schema(self.config.schema_mode).await?;

        progress.enter(Phase::Acquire);
        let acquired = self
            .acquirer
            .acquire(
                ctx,
                &AcquireRequest {
                    period: ctx.period,
                    source_type: ctx.source_type,
                    target_dir: period_download_dir(&self.config.download_dir, ctx.period),
                    local_file: self.config.local_file.clone(),
                },
            )
            .await?;
        if let Acquired::Downloaded { via_proxy: Some(proxy), .. } = &acquired {
            info!(proxy = %proxy, "archive obtained through proxy fallback");
        }

        progress.enter(Phase::Extract);
        let workdir = match self.archives.extract(ctx, acquired.path()).await {
            Ok(workdir) => workdir,
            Err(err) => {
                if matches!(err, ExtractError::Corrupt { .. }) && !matches!(acquired, Acquired::Local(_)) {
                    discard_archive(acquired.path()).await;
                }
                return Err(err.into());
            }
        };

        progress.enter(Phase::Parse);
        let mut relations = self.parse(ctx, &workdir).await?;
        let has_reference_data =
            relations.has_catalogs() || relations.has_structure() || relations.has_facts();

        if has_reference_data {
            progress.enter(Phase::Reconcile);
            let summary = self.reconciler.reconcile(ctx, &mut relations);

            progress.enter(Phase::LoadCatalogs);
            for (table, catalog, added) in [
                (Table::InputItems, &relations.input_catalog, summary.inputs_added),
                (Table::AssemblyItems, &relations.assembly_catalog, summary.assemblies_added),
            ] {
                let (parsed, synthesized) = split_synthesized(catalog, added);
                self.save(progress, table, Rows::Catalog(parsed), WritePolicy::Upsert)
                    .await?;
                // A code stored by an earlier release keeps its description.
                self.save(progress, table, Rows::Catalog(synthesized), WritePolicy::AppendIgnore)
                    .await?;
            }

            progress.enter(Phase::LoadStructure);
            if relations.has_structure() {
                self.store
                    .truncate(&[Table::AssemblyInputEdges, Table::AssemblySubassemblyEdges])
                    .await?;
                self.save(
                    progress,
                    Table::AssemblyInputEdges,
                    Rows::Edges(&relations.input_edges),
                    WritePolicy::AppendIgnore,
                )
                .await?;
                self.save(
                    progress,
                    Table::AssemblySubassemblyEdges,
                    Rows::Edges(&relations.subassembly_edges),
                    WritePolicy::AppendIgnore,
                )
                .await?;
            } else {
                info!("no structure relation; existing edges kept");
            }
        } else {
            warn!(period = %ctx.period, "release has no reference relations");
        }

        progress.enter(Phase::LoadFacts);
        let replace = WritePolicy::ReplaceByPeriod(ctx.period);
        self.save(progress, Table::InputPricesMonthly, Rows::Facts(&relations.input_prices), replace)
            .await?;
        self.save(progress, Table::AssemblyCostsMonthly, Rows::Facts(&relations.assembly_costs), replace)
            .await?;
        self.save(
            progress,
            Table::MaintenanceEvents,
            Rows::Maintenance(&relations.maintenance),
            WritePolicy::AppendIgnore,
        )
        .await?;

        if relations.has_maintenance() {
            progress.enter(Phase::SyncStatus);
            self.status.sync(ctx, self.store.as_ref()).await?;
        } else {
            info!(phase = Phase::SyncStatus.as_str(), "skipped: release has no maintenance relation");
        }

        progress.enter(Phase::Done);
        Ok(if has_reference_data {
            RunStatus::Success
        } else {
            RunStatus::SuccessNoData
        })
    }

    async fn parse(&self, ctx: &RunContext, workdir: &Path) -> Result<ExtractedRelations> {
        let workbooks = discover_workbooks(workdir)?;
        for ignored in &workbooks.unclassified {
            warn!(workbook = %ignored.display(), "workbook is neither reference nor maintenance; ignored");
        }

        let mut relations = ExtractedRelations::default();
        for workbook in [workbooks.reference, workbooks.maintenance].into_iter().flatten() {
            let extractor = self.extractor_for(&workbook)?;
            let task_ctx = ctx.clone();
            let extracted = tokio::task::spawn_blocking(move || extractor.extract(&task_ctx, &workbook))
                .await
                .map_err(ProcessingError::from)??;
            relations.merge(extracted);
        }
        relations.dedupe();

        info!(
            inputs = relations.input_catalog.len(),
            assemblies = relations.assembly_catalog.len(),
            input_edges = relations.input_edges.len(),
            subassembly_edges = relations.subassembly_edges.len(),
            input_prices = relations.input_prices.len(),
            assembly_costs = relations.assembly_costs.len(),
            maintenance = relations.maintenance.len(),
            "relations extracted"
        );
        Ok(relations)
    }

    fn extractor_for(&self, workbook: &Path) -> Result<Arc<dyn RelationExtractor>, RelationError> {
        if let Some(custom) = &self.extractor {
            if custom.supports(workbook) {
                return Ok(Arc::clone(custom));
            }
        }
        extractor_for(workbook)
            .map(Arc::from)
            .ok_or_else(|| RelationError::Unsupported(workbook.to_path_buf()))
    }

    async fn save(&self, progress: &mut Progress, table: Table, rows: Rows<'_>, policy: WritePolicy) -> Result<()> {
        if rows.is_empty() {
            info!(table = table.name(), "skipped: empty relation");
            return Ok(());
        }
        let written = self.store.save(table, rows, policy).await?;
        progress.record(table, written);
        Ok(())
    }

    fn conclude(
        &self,
        ctx: &RunContext,
        started_at: DateTime<Utc>,
        progress: Progress,
        outcome: Result<RunStatus>,
    ) -> RunResult {
        let _entered = ctx.span().enter();
        let (status, message, error_kind, failed_phase, retryable) = match outcome {
            Ok(RunStatus::SuccessNoData) => (
                RunStatus::SuccessNoData,
                format!("no reference workbook data for {}", ctx.period),
                None,
                None,
                false,
            ),
            Ok(status) => (status, format!("period {} loaded", ctx.period), None, None, false),
            Err(err) => {
                error!(
                    phase = progress.phase.as_str(),
                    kind = err.kind(),
                    retryable = err.is_retryable(),
                    error = %err,
                    "run failed"
                );
                (
                    RunStatus::Failure,
                    err.to_string(),
                    Some(err.kind().to_string()),
                    Some(progress.phase.as_str().to_string()),
                    err.is_retryable(),
                )
            }
        };

        let result = RunResult {
            run_id: ctx.run_id,
            status,
            message,
            period: Some(ctx.period),
            tables_updated: progress.tables_updated,
            records_inserted: progress.records_inserted,
            started_at,
            finished_at: Utc::now(),
            error_kind,
            failed_phase,
            retryable,
        };
        info!(
            status = %result.status,
            records_inserted = result.records_inserted,
            tables = ?result.tables_updated,
            elapsed_ms = (result.finished_at - result.started_at).num_milliseconds(),
            "run finished"
        );
        result
    }

    async fn persist_report(&self, result: &RunResult) {
        if let Err(err) = write_run_report(&self.config.reports_dir, result).await {
            warn!(run_id = %result.run_id, error = %format!("{err:#}"), "could not write run report");
        }
    }
}

/// Drops a downloaded archive that failed to open so the next run fetches it
/// again instead of reusing it.
async fn discard_archive(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => warn!(path = %path.display(), "corrupt archive removed from the download cache"),
        Err(err) => warn!(path = %path.display(), error = %err, "could not remove corrupt archive"),
    }
}
