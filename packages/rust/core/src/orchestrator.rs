//! Chains the jobs of one builder run.

use tracing::{info, instrument};
use wikiselect_shared::Result;

use crate::context::AppContext;
use crate::jobs::JobPayload;

/// Broker ids of the jobs enqueued for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderRun {
    pub materialize_job_id: String,
    /// `None` outside production, where exports are skipped.
    pub export_job_id: Option<String>,
}

pub struct PipelineOrchestrator<'a> {
    ctx: &'a AppContext,
}

impl<'a> PipelineOrchestrator<'a> {
    pub fn new(ctx: &'a AppContext) -> Self {
        Self { ctx }
    }

    /// Enqueue a materialization, followed by an archive export that only
    /// becomes eligible once the materialization has finished.
    ///
    /// Enqueue failures propagate; nothing is retried.
    #[instrument(skip_all, fields(builder_id = %builder_id))]
    pub async fn enqueue_builder_run(
        &self,
        builder_id: &str,
        schedule_id: Option<&str>,
    ) -> Result<BuilderRun> {
        let materialize = JobPayload::Materialize {
            builder_id: builder_id.to_string(),
        };
        let materialize_job = self.ctx.queue.enqueue(materialize.to_job()?).await?;

        let export_job_id = if self.ctx.config.app.is_production() {
            let export = JobPayload::Export {
                builder_id: builder_id.to_string(),
                schedule_id: schedule_id.map(str::to_string),
            };
            let job = export.to_job()?.depends_on(&materialize_job.id);
            Some(self.ctx.queue.enqueue(job).await?.id)
        } else {
            None
        };

        info!(
            materialize_job = %materialize_job.id,
            export_job = export_job_id.as_deref().unwrap_or("-"),
            "builder run enqueued"
        );
        Ok(BuilderRun {
            materialize_job_id: materialize_job.id,
            export_job_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::*;
    use serde_json::json;
    use wikiselect_shared::{Environment, JobStatus};

    #[tokio::test]
    async fn export_waits_on_materialize_in_production() {
        let harness = Harness::new().await;
        let builder = harness.builder("alice", json!({"list": ["Photon"]})).await;

        let run = harness
            .ctx
            .orchestrator()
            .enqueue_builder_run(&builder.id, None)
            .await
            .unwrap();
        let export_id = run.export_job_id.expect("export job in production");

        let export = harness.ctx.storage.get_job(&export_id).await.unwrap().unwrap();
        assert_eq!(export.status, JobStatus::Deferred);
        assert_eq!(export.depends_on.as_deref(), Some(run.materialize_job_id.as_str()));
    }

    #[tokio::test]
    async fn export_is_skipped_outside_production() {
        let harness = Harness::with_environment(Environment::Development).await;
        let builder = harness.builder("alice", json!({"list": ["Photon"]})).await;

        let run = harness
            .ctx
            .orchestrator()
            .enqueue_builder_run(&builder.id, None)
            .await
            .unwrap();
        assert!(run.export_job_id.is_none());
        assert_eq!(harness.ctx.storage.list_jobs(None).await.unwrap().len(), 1);
    }
}
