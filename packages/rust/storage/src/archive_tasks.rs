//! Archive task persistence.
//!
//! A task moves `NOT_REQUESTED -> REQUESTED -> COMPLETED | FAILED`, or straight
//! to `FAILED` when the build service rejects the submission. Terminal states
//! are never left. At most one task per selection may be `REQUESTED`; the
//! partial unique index enforces it even under concurrent writers.

use libsql::params;
use tracing::debug;
use wikiselect_shared::{ArchiveStatus, ArchiveTask, Result, WikiSelectError};

use crate::{Storage, db_err, get_opt_string, get_opt_ts, get_string, now_ts, parse_ts, ts};

const TASK_COLUMNS: &str = "id, selection_id, status, external_task_id, schedule_id,
     error_message, requested_at, updated_at";

impl Storage {
    pub async fn insert_archive_task(&self, task: &ArchiveTask) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO archive_tasks (id, selection_id, status, external_task_id,
                   schedule_id, error_message, requested_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    task.id.as_str(),
                    task.selection_id.as_str(),
                    task.status.to_string(),
                    task.external_task_id.as_deref(),
                    task.schedule_id.as_deref(),
                    task.error_message.as_deref(),
                    task.requested_at.as_ref().map(ts),
                    ts(&task.updated_at),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Move a `NOT_REQUESTED` task to `REQUESTED`.
    ///
    /// Fails with a conflict if another task for the same selection is already
    /// in flight, or if this task has left `NOT_REQUESTED`.
    pub async fn mark_archive_requested(&self, task_id: &str) -> Result<ArchiveTask> {
        let now = now_ts();
        let updated = self
            .conn
            .execute(
                "UPDATE archive_tasks SET status = 'REQUESTED', requested_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND status = 'NOT_REQUESTED'
                   AND NOT EXISTS (
                     SELECT 1 FROM archive_tasks other
                     WHERE other.selection_id = archive_tasks.selection_id
                       AND other.status = 'REQUESTED')",
                params![now.as_str(), task_id],
            )
            .await
            .map_err(db_err)?;

        if updated == 0 {
            return match self.get_archive_task(task_id).await? {
                None => Err(WikiSelectError::not_found(format!("archive task {task_id}"))),
                Some(task) => Err(WikiSelectError::conflict(format!(
                    "archive task {task_id} cannot be requested (status {}, or another request \
                     for selection {} is in flight)",
                    task.status, task.selection_id
                ))),
            };
        }

        debug!(task_id, "archive task requested");
        self.get_archive_task(task_id)
            .await?
            .ok_or_else(|| WikiSelectError::not_found(format!("archive task {task_id}")))
    }

    pub async fn set_external_task_id(&self, task_id: &str, external_id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE archive_tasks SET external_task_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![external_id, now_ts(), task_id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Attach an error message without changing the status.
    pub async fn set_archive_error(&self, task_id: &str, message: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE archive_tasks SET error_message = ?1, updated_at = ?2 WHERE id = ?3",
                params![message, now_ts(), task_id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Move a task into a terminal state.
    ///
    /// Only non-terminal tasks move; returns `false` if the task was already
    /// terminal (or does not exist), which makes repeated signals harmless.
    pub async fn finish_archive_task(
        &self,
        task_id: &str,
        status: ArchiveStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(WikiSelectError::validation(format!(
                "{status} is not a terminal archive status"
            )));
        }
        let updated = self
            .conn
            .execute(
                "UPDATE archive_tasks
                 SET status = ?1, error_message = COALESCE(?2, error_message), updated_at = ?3
                 WHERE id = ?4 AND status IN ('NOT_REQUESTED', 'REQUESTED')",
                params![status.to_string(), error_message, now_ts(), task_id],
            )
            .await
            .map_err(db_err)?;
        Ok(updated > 0)
    }

    pub async fn get_archive_task(&self, id: &str) -> Result<Option<ArchiveTask>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM archive_tasks WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// The `REQUESTED` task carrying a build service id, if any.
    pub async fn find_requested_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<ArchiveTask>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM archive_tasks
                     WHERE external_task_id = ?1 AND status = 'REQUESTED'
                     LIMIT 1"
                ),
                params![external_id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Every in-flight task, oldest request first.
    pub async fn list_requested_archive_tasks(&self) -> Result<Vec<ArchiveTask>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM archive_tasks WHERE status = 'REQUESTED'
                     ORDER BY requested_at"
                ),
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_task(&row)?);
        }
        Ok(results)
    }

    pub async fn list_archive_tasks(&self, selection_id: &str) -> Result<Vec<ArchiveTask>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM archive_tasks WHERE selection_id = ?1
                     ORDER BY updated_at DESC"
                ),
                params![selection_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_task(&row)?);
        }
        Ok(results)
    }

    pub async fn has_terminal_archive_task(&self, selection_id: &str) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM archive_tasks
                 WHERE selection_id = ?1 AND status IN ('COMPLETED', 'FAILED')",
                params![selection_id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) > 0),
            Ok(None) => Ok(false),
            Err(e) => Err(db_err(e)),
        }
    }
}

fn row_to_task(row: &libsql::Row) -> Result<ArchiveTask> {
    let status: ArchiveStatus = get_string(row, 2)?
        .parse()
        .map_err(WikiSelectError::Storage)?;
    Ok(ArchiveTask {
        id: get_string(row, 0)?,
        selection_id: get_string(row, 1)?,
        status,
        external_task_id: get_opt_string(row, 3),
        schedule_id: get_opt_string(row, 4),
        error_message: get_opt_string(row, 5),
        requested_at: get_opt_ts(row, 6)?,
        updated_at: parse_ts(&get_string(row, 7)?)?,
    })
}
