//! Archive task tracking: submission, status ingestion and ready notifications.
//!
//! A task is created `NOT_REQUESTED`, moved to `REQUESTED` by a guarded
//! update right before submission, and reaches `COMPLETED` or `FAILED` only
//! through a build service signal or a rejected submission.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use wikiselect_shared::{
    ArchiveStatus, ArchiveTask, EmailState, Result, SelectionStatus, WikiSelectError, new_id,
};

use crate::context::AppContext;
use crate::farm::{ArchiveRequest, RemoteStatus};
use crate::mail::ready_message;

/// Counts from one polling pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub checked: usize,
    pub completed: usize,
    pub failed: usize,
    pub errors: usize,
}

/// Progress callback for [`ArchiveTaskTracker::wait_for`].
pub trait WaitProgress: Send + Sync {
    /// Called after every status check.
    fn update(&self, task: &ArchiveTask, elapsed: Duration);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl WaitProgress for SilentProgress {
    fn update(&self, _task: &ArchiveTask, _elapsed: Duration) {}
}

pub struct ArchiveTaskTracker<'a> {
    ctx: &'a AppContext,
}

impl<'a> ArchiveTaskTracker<'a> {
    pub fn new(ctx: &'a AppContext) -> Self {
        Self { ctx }
    }

    /// Request an archive build for an `OK` selection.
    ///
    /// Oversize selections are refused before anything is submitted; the task
    /// then stays `NOT_REQUESTED` with the reason attached. A rejected
    /// submission moves the task to `FAILED`.
    #[instrument(skip_all, fields(selection_id = %selection_id))]
    pub async fn request_export(
        &self,
        selection_id: &str,
        schedule_id: Option<&str>,
    ) -> Result<ArchiveTask> {
        let storage = &self.ctx.storage;
        let selection = storage
            .get_selection(selection_id)
            .await?
            .ok_or_else(|| WikiSelectError::not_found(format!("selection {selection_id}")))?;
        if selection.status != SelectionStatus::Ok {
            return Err(WikiSelectError::validation(format!(
                "selection {selection_id} has status {}; only OK selections can be exported",
                selection.status
            )));
        }
        let builder = storage
            .get_builder(&selection.builder_id)
            .await?
            .ok_or_else(|| WikiSelectError::not_found(format!("builder {}", selection.builder_id)))?;

        let now = Utc::now();
        let task = ArchiveTask {
            id: new_id(),
            selection_id: selection.id.clone(),
            status: ArchiveStatus::NotRequested,
            external_task_id: None,
            schedule_id: schedule_id.map(str::to_string),
            error_message: None,
            requested_at: None,
            updated_at: now,
        };
        storage.insert_archive_task(&task).await?;

        let max_articles = self.ctx.config.archive.max_articles;
        if selection.article_count > max_articles {
            let message = format!(
                "selection has {} articles, the limit is {max_articles}",
                selection.article_count
            );
            storage.set_archive_error(&task.id, &message).await?;
            warn!(task_id = %task.id, %message, "export refused");
            return Err(WikiSelectError::capacity(message));
        }

        if let Err(e) = storage.mark_archive_requested(&task.id).await {
            storage.set_archive_error(&task.id, &e.to_string()).await?;
            return Err(e);
        }

        let schedule = match schedule_id {
            Some(id) => storage.get_schedule(id).await?,
            None => None,
        };
        let request = ArchiveRequest {
            selection_id: selection.id.clone(),
            project: builder.project.clone(),
            title: schedule
                .as_ref()
                .map(|s| s.title.clone())
                .unwrap_or_else(|| builder.name.clone()),
            description: schedule.as_ref().and_then(|s| s.description.clone()),
            long_description: schedule.as_ref().and_then(|s| s.long_description.clone()),
            article_list_url: self.ctx.artifacts.public_url(&selection.storage_key),
            article_count: selection.article_count,
        };

        match self.ctx.archive_service.submit(&request).await {
            Ok(external_id) => {
                storage.set_external_task_id(&task.id, &external_id).await?;
                storage
                    .set_selection_archive_version(&builder.id, selection.version)
                    .await?;
                info!(task_id = %task.id, external_task_id = %external_id, "archive build requested");
            }
            Err(e) => {
                storage
                    .finish_archive_task(&task.id, ArchiveStatus::Failed, Some(&e.to_string()))
                    .await?;
                warn!(task_id = %task.id, error = %e, "archive submission rejected");
                return Err(e);
            }
        }

        self.get(&task.id).await
    }

    /// Apply a status reported by the build service.
    ///
    /// Only `REQUESTED` tasks move. Unknown or stale ids are logged and
    /// ignored, as are non-terminal statuses. Returns the updated task when
    /// something changed.
    #[instrument(skip_all, fields(external_task_id = %external_task_id))]
    pub async fn apply_status(
        &self,
        external_task_id: &str,
        status: RemoteStatus,
    ) -> Result<Option<ArchiveTask>> {
        let storage = &self.ctx.storage;
        let Some(task) = storage.find_requested_by_external_id(external_task_id).await? else {
            warn!("status for unknown or finished archive task ignored");
            return Ok(None);
        };

        let moved = match &status {
            RemoteStatus::Pending => {
                debug!(task_id = %task.id, "archive build still pending");
                return Ok(None);
            }
            RemoteStatus::Completed => {
                storage
                    .finish_archive_task(&task.id, ArchiveStatus::Completed, None)
                    .await?
            }
            RemoteStatus::Failed(reason) => {
                let message = reason.as_deref().unwrap_or("archive build failed");
                storage
                    .finish_archive_task(&task.id, ArchiveStatus::Failed, Some(message))
                    .await?
            }
        };
        if !moved {
            return Ok(None);
        }

        let task = self.get(&task.id).await?;
        info!(task_id = %task.id, status = %task.status, "archive task finished");
        if task.status == ArchiveStatus::Completed {
            self.notify_ready(&task).await;
        }
        Ok(Some(task))
    }

    /// Ask the build service about every `REQUESTED` task.
    pub async fn poll_requested(&self) -> Result<PollSummary> {
        let mut summary = PollSummary::default();
        for task in self.ctx.storage.list_requested_archive_tasks().await? {
            let Some(external_id) = task.external_task_id.as_deref() else {
                continue;
            };
            summary.checked += 1;
            match self.poll_one(external_id).await {
                Ok(Some(updated)) if updated.status == ArchiveStatus::Completed => {
                    summary.completed += 1
                }
                Ok(Some(_)) => summary.failed += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "archive status poll failed");
                    summary.errors += 1;
                }
            }
        }
        info!(
            checked = summary.checked,
            completed = summary.completed,
            failed = summary.failed,
            "archive poll complete"
        );
        Ok(summary)
    }

    async fn poll_one(&self, external_id: &str) -> Result<Option<ArchiveTask>> {
        let status = self.ctx.archive_service.status(external_id).await?;
        self.apply_status(external_id, status).await
    }

    /// Poll one task until it is terminal or `timeout` runs out.
    pub async fn wait_for(
        &self,
        task_id: &str,
        interval: Duration,
        timeout: Duration,
        progress: &dyn WaitProgress,
    ) -> Result<ArchiveTask> {
        let started = std::time::Instant::now();
        loop {
            let mut task = self.get(task_id).await?;
            if !task.status.is_terminal() {
                if let Some(external_id) = task.external_task_id.clone() {
                    if let Some(updated) = self.poll_one(&external_id).await? {
                        task = updated;
                    }
                }
            }
            progress.update(&task, started.elapsed());

            if task.status.is_terminal() || task.status == ArchiveStatus::NotRequested {
                return Ok(task);
            }
            if started.elapsed() >= timeout {
                return Err(WikiSelectError::upstream(format!(
                    "archive task {task_id} still {} after {}s",
                    task.status,
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(interval).await;
        }
    }

    pub async fn get(&self, task_id: &str) -> Result<ArchiveTask> {
        self.ctx
            .storage
            .get_archive_task(task_id)
            .await?
            .ok_or_else(|| WikiSelectError::not_found(format!("archive task {task_id}")))
    }

    pub async fn list_for_selection(&self, selection_id: &str) -> Result<Vec<ArchiveTask>> {
        self.ctx.storage.list_archive_tasks(selection_id).await
    }

    /// Mail a confirmed subscriber of the triggering schedule. Failures are logged only.
    async fn notify_ready(&self, task: &ArchiveTask) {
        let Some(schedule_id) = task.schedule_id.as_deref() else {
            return;
        };
        let schedule = match self.ctx.storage.get_schedule(schedule_id).await {
            Ok(Some(schedule)) => schedule,
            Ok(None) => return,
            Err(e) => {
                warn!(schedule_id, error = %e, "could not load schedule for notification");
                return;
            }
        };
        if schedule.email_state() != EmailState::Confirmed {
            return;
        }
        let Some(email) = schedule.email.as_deref() else {
            return;
        };

        let message = ready_message(
            &schedule,
            email,
            schedule.unsubscribe_token.as_deref(),
            &self.ctx.config.app.web_base_url,
        );
        match self.ctx.mailer.send(&message).await {
            Ok(()) => info!(schedule_id, "archive ready notification sent"),
            Err(e) => warn!(schedule_id, error = %e, "archive ready notification not sent"),
        }
    }
}
