//! Job worker: takes jobs off the broker and runs them.

use std::future::Future;

use serde_json::{Value, json};
use tracing::{error, info, instrument, warn};
use wikiselect_shared::{JobRecord, Result, Selection, TSV_CONTENT_TYPE, WikiSelectError};

use crate::context::AppContext;
use crate::jobs::{ALL_QUEUES, JobPayload};

/// What happened to a dequeued job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Finished { job_id: String },
    Failed { job_id: String, error: String },
}

pub struct Worker<'a> {
    ctx: &'a AppContext,
    queues: Vec<String>,
}

impl<'a> Worker<'a> {
    /// A worker serving every pipeline queue.
    pub fn new(ctx: &'a AppContext) -> Self {
        Self::for_queues(ctx, ALL_QUEUES.iter().map(|q| q.to_string()).collect())
    }

    /// A worker serving `queues`, first queue first.
    pub fn for_queues(ctx: &'a AppContext, queues: Vec<String>) -> Self {
        Self { ctx, queues }
    }

    /// Take one job and run it. Returns `None` if nothing arrived before the
    /// dequeue timeout.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>> {
        let queues: Vec<&str> = self.queues.iter().map(String::as_str).collect();
        let Some(job) = self
            .ctx
            .queue
            .dequeue_any(&queues, self.ctx.config.queue.dequeue_timeout())
            .await?
        else {
            return Ok(None);
        };

        match self.execute(&job).await {
            Ok(result) => {
                self.ctx.queue.complete(&job.id, result.as_ref()).await?;
                Ok(Some(JobOutcome::Finished { job_id: job.id }))
            }
            Err(e) => {
                let message = e.to_string();
                error!(job_id = %job.id, queue = %job.queue, error = %message, "job failed");
                self.ctx.queue.fail(&job.id, &message).await?;
                Ok(Some(JobOutcome::Failed {
                    job_id: job.id,
                    error: message,
                }))
            }
        }
    }

    /// Process jobs until `shutdown` resolves. A job in progress is finished first.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        info!(queues = ?self.queues, "worker started");
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                result = self.run_once() => {
                    if let Err(e) = result {
                        warn!(error = %e, "worker iteration failed");
                        tokio::time::sleep(self.ctx.config.queue.poll_interval()).await;
                    }
                }
            }
        }
        info!("worker stopped");
        Ok(())
    }

    /// Run one job. The returned value is recorded as the job's result.
    #[instrument(skip_all, fields(job_id = %job.id, queue = %job.queue))]
    async fn execute(&self, job: &JobRecord) -> Result<Option<Value>> {
        match JobPayload::from_record(job)? {
            JobPayload::Materialize { builder_id } => {
                let selection = self.ctx.materializer().run(&builder_id).await?;
                Ok(Some(json!({
                    "selection_id": selection.id,
                    "version": selection.version,
                })))
            }
            JobPayload::Export {
                builder_id,
                schedule_id,
            } => {
                let selection = self.export_source(job, &builder_id).await?;
                let task = self
                    .ctx
                    .archive_tracker()
                    .request_export(&selection.id, schedule_id.as_deref())
                    .await?;
                Ok(Some(json!({ "archive_task_id": task.id })))
            }
            JobPayload::FireSchedule { schedule_id } => {
                self.ctx.scheduler().fire_timer(&schedule_id, &job.id).await?;
                Ok(None)
            }
        }
    }

    /// The selection an export job ships: the one produced by the materialize
    /// job it depends on, or the builder's latest when it has no such parent.
    async fn export_source(&self, job: &JobRecord, builder_id: &str) -> Result<Selection> {
        let selection_id = match &job.depends_on {
            Some(parent_id) => {
                let result = self.ctx.queue.result(parent_id).await?;
                let selection_id = result
                    .as_ref()
                    .and_then(|r| r.get("selection_id"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        WikiSelectError::not_found(format!(
                            "selection produced by job {parent_id}"
                        ))
                    })?;
                Some(selection_id.to_string())
            }
            None => None,
        };

        let selections = self.ctx.selections();
        match selection_id {
            Some(id) => selections.get(&id).await,
            None => selections
                .latest(builder_id, TSV_CONTENT_TYPE)
                .await?
                .ok_or_else(|| {
                    WikiSelectError::not_found(format!("selection for builder {builder_id}"))
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use serde_json::json;
    use wikiselect_shared::{ArchiveStatus, JobStatus, ScheduleStatus};

    #[tokio::test]
    async fn runs_materialize_then_export() {
        let harness = Harness::new().await;
        let builder = harness.builder("alice", json!({"list": ["Photon", "Electron"]})).await;
        let run = harness
            .ctx
            .orchestrator()
            .enqueue_builder_run(&builder.id, None)
            .await
            .unwrap();
        let worker = Worker::new(&harness.ctx);

        let first = worker.run_once().await.unwrap().unwrap();
        assert_eq!(
            first,
            JobOutcome::Finished {
                job_id: run.materialize_job_id.clone()
            }
        );
        let second = worker.run_once().await.unwrap().unwrap();
        assert_eq!(
            second,
            JobOutcome::Finished {
                job_id: run.export_job_id.clone().unwrap()
            }
        );
        assert!(worker.run_once().await.unwrap().is_none());

        let selection = harness
            .ctx
            .selections()
            .latest(&builder.id, TSV_CONTENT_TYPE)
            .await
            .unwrap()
            .unwrap();
        let tasks = harness
            .ctx
            .archive_tracker()
            .list_for_selection(&selection.id)
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, ArchiveStatus::Requested);
    }

    #[tokio::test]
    async fn failed_materialize_cancels_export() {
        let harness = Harness::new().await;
        let builder = harness.builder("alice", json!({"list": ["Photon"]})).await;
        harness
            .ctx
            .storage
            .update_builder_definition(&builder.id, "x", "en.wikipedia.org", "simple", &json!({}))
            .await
            .unwrap();
        let run = harness
            .ctx
            .orchestrator()
            .enqueue_builder_run(&builder.id, None)
            .await
            .unwrap();
        let worker = Worker::new(&harness.ctx);

        let outcome = worker.run_once().await.unwrap().unwrap();
        assert!(matches!(outcome, JobOutcome::Failed { .. }));
        assert_eq!(
            harness
                .ctx
                .queue
                .status(&run.export_job_id.unwrap())
                .await
                .unwrap(),
            Some(JobStatus::Canceled)
        );
        assert!(worker.run_once().await.unwrap().is_none());
        assert!(harness.archive.submitted().is_empty());
    }

    #[tokio::test]
    async fn schedule_timer_drives_a_run() {
        let harness = Harness::new().await;
        let builder = harness.builder("alice", json!({"list": ["Photon"]})).await;
        let schedule = harness
            .ctx
            .scheduler()
            .create_schedule("alice", &builder.id, schedule_params(None, Some(1)))
            .await
            .unwrap();
        let worker = Worker::new(&harness.ctx);

        // Timer, materialize, export.
        for _ in 0..3 {
            let outcome = worker.run_once().await.unwrap().unwrap();
            assert!(matches!(outcome, JobOutcome::Finished { .. }), "{outcome:?}");
        }
        let schedule = harness.ctx.scheduler().get(&schedule.id).await.unwrap();
        assert_eq!(schedule.status, ScheduleStatus::Exhausted);

        let submitted = harness.archive.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].title, "Physics articles");
    }

    #[tokio::test]
    async fn export_ships_the_selection_of_its_own_run() {
        let harness = Harness::new().await;
        let builder = harness.builder("alice", json!({"list": ["Photon"]})).await;
        let orchestrator = harness.ctx.orchestrator();
        let worker = Worker::new(&harness.ctx);

        let first = orchestrator.enqueue_builder_run(&builder.id, None).await.unwrap();
        worker.run_once().await.unwrap().unwrap();
        let materialized = harness
            .ctx
            .queue
            .result(&first.materialize_job_id)
            .await
            .unwrap()
            .unwrap();
        let first_selection = materialized["selection_id"].as_str().unwrap().to_string();

        // The next run fails to materialize while the first export still waits.
        harness
            .ctx
            .storage
            .update_builder_definition(&builder.id, "x", "en.wikipedia.org", "simple", &json!({}))
            .await
            .unwrap();
        let second = orchestrator.enqueue_builder_run(&builder.id, None).await.unwrap();

        let outcome = worker.run_once().await.unwrap().unwrap();
        assert!(matches!(outcome, JobOutcome::Failed { .. }));
        let outcome = worker.run_once().await.unwrap().unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Finished {
                job_id: first.export_job_id.clone().unwrap()
            }
        );
        assert!(worker.run_once().await.unwrap().is_none());
        assert_eq!(
            harness
                .ctx
                .queue
                .status(&second.export_job_id.unwrap())
                .await
                .unwrap(),
            Some(JobStatus::Canceled)
        );

        assert_eq!(harness.archive.submitted().len(), 1);
        let tasks = harness
            .ctx
            .archive_tracker()
            .list_for_selection(&first_selection)
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn back_to_back_runs_export_their_own_versions() {
        let harness = Harness::new().await;
        let builder = harness.builder("alice", json!({"list": ["Photon"]})).await;
        let orchestrator = harness.ctx.orchestrator();
        orchestrator.enqueue_builder_run(&builder.id, None).await.unwrap();
        orchestrator.enqueue_builder_run(&builder.id, None).await.unwrap();
        let worker = Worker::new(&harness.ctx);

        // Both materializations run before either export.
        for _ in 0..4 {
            let outcome = worker.run_once().await.unwrap().unwrap();
            assert!(matches!(outcome, JobOutcome::Finished { .. }), "{outcome:?}");
        }

        assert_eq!(harness.archive.submitted().len(), 2);
        for selection in harness.ctx.selections().list(&builder.id).await.unwrap() {
            let tasks = harness
                .ctx
                .archive_tracker()
                .list_for_selection(&selection.id)
                .await
                .unwrap();
            assert_eq!(tasks.len(), 1, "version {}", selection.version);
        }
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let harness = Harness::new().await;
        let worker = Worker::new(&harness.ctx);
        worker.run(async {}).await.unwrap();
    }
}
