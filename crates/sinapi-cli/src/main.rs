use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use sinapi_core::{ArchiveFormat, RunStatus, SourceType};
use sinapi_pipeline::store::{create_statements, drop_statements};
use sinapi_pipeline::{
    maybe_build_scheduler, period_from, pipeline_from_config, recent_runs_markdown, write_run_report, PgStore,
    PipelineConfig, PipelineError, RelationalStore, RunResult, SchemaMode,
};
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Conventional exit status for a process stopped by SIGINT.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Debug, Parser)]
#[command(name = "sinapi")]
#[command(about = "SINAPI monthly reference-cost loader")]
struct Cli {
    /// YAML configuration file; SINAPI_* environment variables override it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load one reference period.
    Run(RunArgs),
    /// Create the schema without loading anything.
    Migrate {
        #[arg(long)]
        schema_mode: Option<SchemaMode>,
        /// Print the DDL instead of executing it.
        #[arg(long)]
        print: bool,
    },
    /// Run the pipeline on the configured cron until interrupted.
    Schedule,
    /// Summarize the most recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    #[arg(long)]
    year: Option<i32>,
    #[arg(long)]
    month: Option<u32>,
    /// REFERENCIA or DESONERADO.
    #[arg(long)]
    source_type: Option<SourceType>,
    /// Archive or workbook to load instead of downloading.
    #[arg(long)]
    local_file: Option<PathBuf>,
    #[arg(long)]
    format: Option<ArchiveFormat>,
    #[arg(long)]
    schema_mode: Option<SchemaMode>,
}

impl RunArgs {
    fn apply(self, config: &mut PipelineConfig) {
        if self.year.is_some() {
            config.year = self.year;
        }
        if self.month.is_some() {
            config.month = self.month;
        }
        if let Some(source_type) = self.source_type {
            config.source_type = source_type;
        }
        if self.local_file.is_some() {
            config.local_file = self.local_file;
        }
        if let Some(format) = self.format {
            config.format = format;
        }
        if let Some(mode) = self.schema_mode {
            config.schema_mode = mode;
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<PipelineConfig, sinapi_pipeline::ConfigError> {
    match path {
        Some(path) => PipelineConfig::from_yaml_file_and_env(path),
        None => PipelineConfig::from_env(),
    }
}

fn exit_status(result: &RunResult) -> u8 {
    match result.status {
        RunStatus::Success => 0,
        RunStatus::SuccessNoData => 2,
        RunStatus::Failure if result.error_kind.as_deref() == Some(PipelineError::Interrupted.kind()) => {
            EXIT_INTERRUPTED
        }
        RunStatus::Failure => 1,
    }
}

async fn record_failure(config: Option<&PipelineConfig>, run_id: Uuid, err: &PipelineError) -> RunResult {
    let period = config.and_then(|c| period_from(c.year, c.month).ok());
    error!(%run_id, kind = err.kind(), error = %err, "run ended without a pipeline result");
    let result = RunResult::failed(run_id, period, Utc::now(), err);
    if let Some(config) = config {
        if let Err(err) = write_run_report(&config.reports_dir, &result).await {
            warn!(error = %format!("{err:#}"), "could not write run report");
        }
    }
    result
}

async fn run(config_path: Option<&PathBuf>, args: RunArgs) -> Result<ExitCode> {
    let run_id = Uuid::new_v4();
    let result = match load_config(config_path) {
        Err(err) => record_failure(None, run_id, &PipelineError::from(err)).await,
        Ok(mut config) => {
            args.apply(&mut config);
            match pipeline_from_config(config.clone()).await {
                Err(err) => record_failure(Some(&config), run_id, &err).await,
                Ok(pipeline) => {
                    tokio::select! {
                        result = pipeline.run_with_id(run_id) => result,
                        _ = tokio::signal::ctrl_c() => {
                            warn!(%run_id, "interrupt received; abandoning run");
                            record_failure(Some(&config), run_id, &PipelineError::Interrupted).await
                        }
                    }
                }
            }
        }
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("serializing run result")?
    );
    Ok(ExitCode::from(exit_status(&result)))
}

async fn migrate(config_path: Option<&PathBuf>, schema_mode: Option<SchemaMode>, print: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let mode = schema_mode.unwrap_or(config.schema_mode);
    if print {
        for statement in drop_statements(mode).iter().chain(create_statements(mode).iter()) {
            println!("{statement};\n");
        }
        return Ok(());
    }
    let store = PgStore::connect(&config.database).await?;
    store.prepare_schema(mode).await?;
    println!("schema ready (mode={})", mode.as_str());
    Ok(())
}

async fn schedule(config_path: Option<&PathBuf>) -> Result<()> {
    let mut config = load_config(config_path)?;
    config.scheduler_enabled = true;
    let pipeline = Arc::new(pipeline_from_config(config).await?);
    let Some(mut sched) = maybe_build_scheduler(pipeline).await? else {
        return Ok(());
    };
    sched.start().await.context("starting scheduler")?;
    info!("scheduler running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for interrupt")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.as_ref();

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => return run(config_path, args).await,
        Commands::Migrate { schema_mode, print } => migrate(config_path, schema_mode, print).await?,
        Commands::Schedule => schedule(config_path).await?,
        Commands::Report { runs } => {
            let config = load_config(config_path)?;
            println!("{}", recent_runs_markdown(&config.reports_dir, runs)?);
        }
    }

    Ok(ExitCode::SUCCESS)
}
