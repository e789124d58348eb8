use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Datelike, Local};
use sinapi_core::ReferencePeriod;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use uuid::Uuid;

use crate::pipeline::Pipeline;

/// Period a scheduled run loads: the month the job fires in.
pub fn current_period() -> Result<ReferencePeriod> {
    let today = Local::now().date_naive();
    ReferencePeriod::new(today.year(), today.month()).context("deriving current reference period")
}

/// `None` unless the scheduler is enabled in the pipeline's configuration.
/// The returned scheduler is not started.
pub async fn maybe_build_scheduler(pipeline: Arc<Pipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }

    let cron = pipeline.config().cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            let period = match current_period() {
                Ok(period) => period,
                Err(err) => {
                    error!(error = %format!("{err:#}"), "scheduled run skipped");
                    return;
                }
            };
            let result = pipeline.run_for_period(Uuid::new_v4(), period).await;
            info!(
                run_id = %result.run_id,
                status = %result.status,
                "scheduled run finished"
            );
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(cron = %cron, "scheduler job registered");
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::store::memory::MemoryStore;

    fn pipeline(config: PipelineConfig) -> Arc<Pipeline> {
        Arc::new(Pipeline::new(config, Arc::new(MemoryStore::default())).unwrap())
    }

    #[tokio::test]
    async fn disabled_scheduler_builds_nothing() {
        let built = maybe_build_scheduler(pipeline(PipelineConfig::default())).await.unwrap();
        assert!(built.is_none());
    }

    #[tokio::test]
    async fn invalid_cron_is_reported() {
        let config = PipelineConfig {
            scheduler_enabled: true,
            cron: "every full moon".into(),
            ..PipelineConfig::default()
        };
        let Err(err) = maybe_build_scheduler(pipeline(config)).await else {
            panic!("an unparseable cron must not build a scheduler");
        };
        assert!(err.to_string().contains("every full moon"));
    }

    #[test]
    fn current_period_is_valid() {
        let period = current_period().unwrap();
        assert!((1..=12).contains(&period.month));
    }
}
