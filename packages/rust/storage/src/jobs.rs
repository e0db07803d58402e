//! Job broker table.
//!
//! Jobs are claimed with an immediate transaction, so two workers never start
//! the same job. A job with a dependency waits as `deferred` until the
//! dependency finishes; if the dependency fails or is cancelled the whole
//! chain below it is cancelled.

use chrono::{DateTime, Utc};
use libsql::{Connection, params};
use tracing::debug;
use wikiselect_shared::{JobRecord, JobStatus, Result, WikiSelectError, new_id};

use crate::{Storage, db_err, get_opt_string, get_opt_ts, get_string, now_ts, parse_ts, ts};

const JOB_COLUMNS: &str = "id, queue, payload_json, status, depends_on, run_at, enqueued_at,
     started_at, ended_at, error, result_json";

/// A job to hand to the broker.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Caller-chosen id, so the id can be recorded before the job exists.
    pub id: Option<String>,
    pub queue: String,
    pub payload: serde_json::Value,
    /// Job that must finish before this one becomes eligible.
    pub depends_on: Option<String>,
    /// Earliest start time.
    pub run_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(queue: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: None,
            queue: queue.into(),
            payload,
            depends_on: None,
            run_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn depends_on(mut self, job_id: impl Into<String>) -> Self {
        self.depends_on = Some(job_id.into());
        self
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }
}

impl Storage {
    /// Insert a job, deriving its initial status from its dependency and start time.
    pub async fn enqueue_job(&self, job: NewJob) -> Result<JobRecord> {
        let payload_json = serde_json::to_string(&job.payload)
            .map_err(|e| WikiSelectError::Queue(format!("encode payload: {e}")))?;

        self.immediate(|conn| async move {
            let now = Utc::now();
            let ready_status = match job.run_at {
                Some(at) if at > now => JobStatus::Scheduled,
                _ => JobStatus::Queued,
            };

            let status = match &job.depends_on {
                None => ready_status,
                Some(parent_id) => match job_status_on(&conn, parent_id).await? {
                    None => {
                        return Err(WikiSelectError::not_found(format!(
                            "dependency job {parent_id}"
                        )));
                    }
                    Some(JobStatus::Finished) => ready_status,
                    Some(JobStatus::Failed | JobStatus::Canceled) => JobStatus::Canceled,
                    Some(_) => JobStatus::Deferred,
                },
            };

            let record = JobRecord {
                id: job.id.unwrap_or_else(new_id),
                queue: job.queue,
                payload: job.payload,
                status,
                depends_on: job.depends_on,
                run_at: job.run_at,
                enqueued_at: now,
                started_at: None,
                ended_at: (status == JobStatus::Canceled).then_some(now),
                error: None,
                result: None,
            };

            conn.execute(
                "INSERT INTO jobs (id, queue, payload_json, status, depends_on, run_at,
                   enqueued_at, ended_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.id.as_str(),
                    record.queue.as_str(),
                    payload_json,
                    record.status.to_string(),
                    record.depends_on.as_deref(),
                    record.run_at.as_ref().map(ts),
                    ts(&record.enqueued_at),
                    record.ended_at.as_ref().map(ts),
                ],
            )
            .await
            .map_err(db_err)?;

            debug!(job_id = %record.id, queue = %record.queue, status = %record.status, "job enqueued");
            Ok(record)
        })
        .await
    }

    /// Claim the oldest eligible job of `queue` and mark it started.
    pub async fn claim_next_job(&self, queue: &str) -> Result<Option<JobRecord>> {
        self.immediate(|conn| async move {
            let now = now_ts();
            let mut rows = conn
                .query(
                    "SELECT id FROM jobs
                     WHERE queue = ?1
                       AND (status = 'queued' OR (status = 'scheduled' AND run_at <= ?2))
                     ORDER BY COALESCE(run_at, enqueued_at), enqueued_at, id
                     LIMIT 1",
                    params![queue, now.as_str()],
                )
                .await
                .map_err(db_err)?;

            let id = match rows.next().await {
                Ok(Some(row)) => get_string(&row, 0)?,
                Ok(None) => return Ok(None),
                Err(e) => return Err(db_err(e)),
            };

            conn.execute(
                "UPDATE jobs SET status = 'started', started_at = ?1 WHERE id = ?2",
                params![now.as_str(), id.as_str()],
            )
            .await
            .map_err(db_err)?;

            get_job_on(&conn, &id).await
        })
        .await
    }

    /// Mark a job finished, record its result and release the jobs deferred on it.
    pub async fn finish_job(&self, id: &str, result: Option<&serde_json::Value>) -> Result<()> {
        let result_json = result
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| WikiSelectError::Queue(format!("encode result: {e}")))?;

        self.immediate(|conn| async move {
            let now = now_ts();
            let updated = conn
                .execute(
                    "UPDATE jobs SET status = 'finished', ended_at = ?1, result_json = ?2
                     WHERE id = ?3 AND status IN ('queued', 'scheduled', 'started')",
                    params![now.as_str(), result_json, id],
                )
                .await
                .map_err(db_err)?;
            if updated == 0 {
                return Err(missing_or_terminal(&conn, id).await);
            }

            let released = conn
                .execute(
                    "UPDATE jobs
                     SET status = CASE WHEN run_at IS NOT NULL AND run_at > ?1
                                       THEN 'scheduled' ELSE 'queued' END
                     WHERE depends_on = ?2 AND status = 'deferred'",
                    params![now.as_str(), id],
                )
                .await
                .map_err(db_err)?;
            debug!(job_id = id, released, "job finished");
            Ok(())
        })
        .await
    }

    /// Mark a job failed and cancel everything that depends on it.
    pub async fn fail_job(&self, id: &str, error: &str) -> Result<()> {
        self.immediate(|conn| async move {
            let now = now_ts();
            let updated = conn
                .execute(
                    "UPDATE jobs SET status = 'failed', ended_at = ?1, error = ?2
                     WHERE id = ?3 AND status IN ('queued', 'scheduled', 'started')",
                    params![now.as_str(), error, id],
                )
                .await
                .map_err(db_err)?;
            if updated == 0 {
                return Err(missing_or_terminal(&conn, id).await);
            }
            cancel_dependents_on(&conn, id, &now).await
        })
        .await
    }

    /// Cancel a job that has not started yet, along with its dependents.
    ///
    /// Returns `false` if the job is already running or done.
    pub async fn cancel_job(&self, id: &str) -> Result<bool> {
        self.immediate(|conn| async move {
            let now = now_ts();
            let updated = conn
                .execute(
                    "UPDATE jobs SET status = 'canceled', ended_at = ?1
                     WHERE id = ?2 AND status IN ('queued', 'deferred', 'scheduled')",
                    params![now.as_str(), id],
                )
                .await
                .map_err(db_err)?;
            if updated == 0 {
                return Ok(false);
            }
            cancel_dependents_on(&conn, id, &now).await?;
            Ok(true)
        })
        .await
    }

    /// Delete jobs that ended before `older_than`.
    ///
    /// A terminal job is kept while an unfinished job still depends on it,
    /// since the dependent reads the parent's result when it runs.
    pub async fn prune_jobs(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let pruned = self
            .conn
            .execute(
                "DELETE FROM jobs
                 WHERE status IN ('finished', 'failed', 'canceled')
                   AND ended_at IS NOT NULL AND ended_at < ?1
                   AND NOT EXISTS (
                     SELECT 1 FROM jobs child
                     WHERE child.depends_on = jobs.id
                       AND child.status NOT IN ('finished', 'failed', 'canceled')
                   )",
                params![ts(&older_than)],
            )
            .await
            .map_err(db_err)?;
        debug!(pruned, "pruned ended jobs");
        Ok(pruned)
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
        get_job_on(&self.conn, id).await
    }

    /// Jobs of one queue (or all queues), oldest first.
    pub async fn list_jobs(&self, queue: Option<&str>) -> Result<Vec<JobRecord>> {
        let mut rows = match queue {
            Some(queue) => {
                self.conn
                    .query(
                        &format!(
                            "SELECT {JOB_COLUMNS} FROM jobs WHERE queue = ?1 ORDER BY enqueued_at"
                        ),
                        params![queue],
                    )
                    .await
            }
            None => {
                self.conn
                    .query(
                        &format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY enqueued_at"),
                        params![],
                    )
                    .await
            }
        }
        .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_job(&row)?);
        }
        Ok(results)
    }
}

async fn job_status_on(conn: &Connection, id: &str) -> Result<Option<JobStatus>> {
    let mut rows = conn
        .query("SELECT status FROM jobs WHERE id = ?1", params![id])
        .await
        .map_err(db_err)?;

    match rows.next().await {
        Ok(Some(row)) => Ok(Some(
            get_string(&row, 0)?
                .parse()
                .map_err(WikiSelectError::Queue)?,
        )),
        Ok(None) => Ok(None),
        Err(e) => Err(db_err(e)),
    }
}

async fn get_job_on(conn: &Connection, id: &str) -> Result<Option<JobRecord>> {
    let mut rows = conn
        .query(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![id],
        )
        .await
        .map_err(db_err)?;

    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
        Ok(None) => Ok(None),
        Err(e) => Err(db_err(e)),
    }
}

async fn cancel_dependents_on(conn: &Connection, id: &str, now: &str) -> Result<()> {
    let canceled = conn
        .execute(
            "WITH RECURSIVE dependents(id) AS (
               SELECT id FROM jobs WHERE depends_on = ?1
               UNION
               SELECT j.id FROM jobs j JOIN dependents d ON j.depends_on = d.id
             )
             UPDATE jobs SET status = 'canceled', ended_at = ?2
             WHERE id IN (SELECT id FROM dependents)
               AND status IN ('queued', 'deferred', 'scheduled')",
            params![id, now],
        )
        .await
        .map_err(db_err)?;
    if canceled > 0 {
        debug!(job_id = id, canceled, "cancelled dependent jobs");
    }
    Ok(())
}

async fn missing_or_terminal(conn: &Connection, id: &str) -> WikiSelectError {
    match job_status_on(conn, id).await {
        Ok(None) => WikiSelectError::not_found(format!("job {id}")),
        Ok(Some(status)) => WikiSelectError::Queue(format!("job {id} is already {status}")),
        Err(e) => e,
    }
}

fn row_to_job(row: &libsql::Row) -> Result<JobRecord> {
    let payload_json = get_string(row, 2)?;
    let status: JobStatus = get_string(row, 3)?
        .parse()
        .map_err(WikiSelectError::Queue)?;
    Ok(JobRecord {
        id: get_string(row, 0)?,
        queue: get_string(row, 1)?,
        payload: serde_json::from_str(&payload_json)
            .map_err(|e| WikiSelectError::Queue(format!("invalid payload_json: {e}")))?,
        status,
        depends_on: get_opt_string(row, 4),
        run_at: get_opt_ts(row, 5)?,
        enqueued_at: parse_ts(&get_string(row, 6)?)?,
        started_at: get_opt_ts(row, 7)?,
        ended_at: get_opt_ts(row, 8)?,
        error: get_opt_string(row, 9),
        result: get_opt_string(row, 10)
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(|e| WikiSelectError::Queue(format!("invalid result_json: {e}")))?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;
    use crate::test_support::*;

    #[tokio::test]
    async fn claim_is_fifo_and_exclusive() {
        let storage = test_storage().await;
        let first = storage.enqueue_job(NewJob::new("materialize", json!({"n": 1}))).await.unwrap();
        let second = storage.enqueue_job(NewJob::new("materialize", json!({"n": 2}))).await.unwrap();

        let claimed = storage.claim_next_job("materialize").await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, JobStatus::Started);
        assert!(claimed.started_at.is_some());

        let claimed = storage.claim_next_job("materialize").await.unwrap().unwrap();
        assert_eq!(claimed.id, second.id);
        assert!(storage.claim_next_job("materialize").await.unwrap().is_none());
        assert!(storage.claim_next_job("export").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dependent_job_waits_for_parent() {
        let storage = test_storage().await;
        let parent = storage.enqueue_job(NewJob::new("materialize", json!({}))).await.unwrap();
        let child = storage
            .enqueue_job(NewJob::new("export", json!({})).depends_on(&parent.id))
            .await
            .unwrap();
        assert_eq!(child.status, JobStatus::Deferred);
        assert!(storage.claim_next_job("export").await.unwrap().is_none());

        storage.claim_next_job("materialize").await.unwrap().unwrap();
        storage.finish_job(&parent.id, None).await.unwrap();

        let claimed = storage.claim_next_job("export").await.unwrap().unwrap();
        assert_eq!(claimed.id, child.id);
    }

    #[tokio::test]
    async fn failed_parent_cancels_chain() {
        let storage = test_storage().await;
        let parent = storage.enqueue_job(NewJob::new("materialize", json!({}))).await.unwrap();
        let child = storage
            .enqueue_job(NewJob::new("export", json!({})).depends_on(&parent.id))
            .await
            .unwrap();
        let grandchild = storage
            .enqueue_job(NewJob::new("export", json!({})).depends_on(&child.id))
            .await
            .unwrap();

        storage.claim_next_job("materialize").await.unwrap().unwrap();
        storage.fail_job(&parent.id, "source unreachable").await.unwrap();

        for id in [&child.id, &grandchild.id] {
            let job = storage.get_job(id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Canceled);
        }
        let parent = storage.get_job(&parent.id).await.unwrap().unwrap();
        assert_eq!(parent.error.as_deref(), Some("source unreachable"));

        // Enqueuing behind a failed job cancels immediately.
        let late = storage
            .enqueue_job(NewJob::new("export", json!({})).depends_on(&parent.id))
            .await
            .unwrap();
        assert_eq!(late.status, JobStatus::Canceled);
    }

    #[tokio::test]
    async fn scheduled_job_is_not_claimed_early() {
        let storage = test_storage().await;
        let later = storage
            .enqueue_job(
                NewJob::new("schedules", json!({})).run_at(Utc::now() + Duration::hours(1)),
            )
            .await
            .unwrap();
        assert_eq!(later.status, JobStatus::Scheduled);
        assert!(storage.claim_next_job("schedules").await.unwrap().is_none());

        let due = storage
            .enqueue_job(
                NewJob::new("schedules", json!({})).run_at(Utc::now() - Duration::seconds(1)),
            )
            .await
            .unwrap();
        assert_eq!(due.status, JobStatus::Queued);
        let claimed = storage.claim_next_job("schedules").await.unwrap().unwrap();
        assert_eq!(claimed.id, due.id);
    }

    #[tokio::test]
    async fn cancel_only_pending_jobs() {
        let storage = test_storage().await;
        let job = storage.enqueue_job(NewJob::new("schedules", json!({}))).await.unwrap();
        assert!(storage.cancel_job(&job.id).await.unwrap());
        assert!(!storage.cancel_job(&job.id).await.unwrap());

        let running = storage.enqueue_job(NewJob::new("schedules", json!({}))).await.unwrap();
        storage.claim_next_job("schedules").await.unwrap().unwrap();
        assert!(!storage.cancel_job(&running.id).await.unwrap());
    }

    #[tokio::test]
    async fn missing_dependency_is_rejected() {
        let storage = test_storage().await;
        let err = storage
            .enqueue_job(NewJob::new("export", json!({})).depends_on("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, WikiSelectError::NotFound { .. }));
    }

    #[tokio::test]
    async fn finishing_twice_is_an_error() {
        let storage = test_storage().await;
        let job = storage.enqueue_job(NewJob::new("materialize", json!({}))).await.unwrap();
        storage.claim_next_job("materialize").await.unwrap().unwrap();
        storage.finish_job(&job.id, None).await.unwrap();
        assert!(storage.finish_job(&job.id, None).await.is_err());
        assert_eq!(storage.list_jobs(Some("materialize")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn finished_job_keeps_its_result() {
        let storage = test_storage().await;
        let job = storage.enqueue_job(NewJob::new("materialize", json!({}))).await.unwrap();
        storage.claim_next_job("materialize").await.unwrap().unwrap();
        storage
            .finish_job(&job.id, Some(&json!({"selection_id": "sel-1"})))
            .await
            .unwrap();

        let job = storage.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Finished);
        assert_eq!(job.result, Some(json!({"selection_id": "sel-1"})));
    }

    #[tokio::test]
    async fn caller_chosen_id_is_kept() {
        let storage = test_storage().await;
        let job = storage
            .enqueue_job(NewJob::new("schedules", json!({})).with_id("timer-1"))
            .await
            .unwrap();
        assert_eq!(job.id, "timer-1");
        assert!(storage.get_job("timer-1").await.unwrap().is_some());

        let err = storage
            .enqueue_job(NewJob::new("schedules", json!({})).with_id("timer-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, WikiSelectError::Conflict { .. }));
    }

    #[tokio::test]
    async fn prune_removes_only_old_ended_jobs() {
        let storage = test_storage().await;
        let done = storage.enqueue_job(NewJob::new("materialize", json!({}))).await.unwrap();
        storage.claim_next_job("materialize").await.unwrap().unwrap();
        storage.finish_job(&done.id, None).await.unwrap();

        let failed = storage.enqueue_job(NewJob::new("materialize", json!({}))).await.unwrap();
        storage.claim_next_job("materialize").await.unwrap().unwrap();
        storage.fail_job(&failed.id, "boom").await.unwrap();

        let pending = storage.enqueue_job(NewJob::new("schedules", json!({}))).await.unwrap();

        // A finished parent whose dependent has not run yet stays.
        let parent = storage.enqueue_job(NewJob::new("materialize", json!({}))).await.unwrap();
        let child = storage
            .enqueue_job(NewJob::new("export", json!({})).depends_on(&parent.id))
            .await
            .unwrap();
        storage.claim_next_job("materialize").await.unwrap().unwrap();
        storage.finish_job(&parent.id, None).await.unwrap();

        assert_eq!(
            storage.prune_jobs(Utc::now() - Duration::hours(1)).await.unwrap(),
            0
        );

        let pruned = storage.prune_jobs(Utc::now() + Duration::seconds(1)).await.unwrap();
        assert_eq!(pruned, 2);
        assert!(storage.get_job(&done.id).await.unwrap().is_none());
        assert!(storage.get_job(&failed.id).await.unwrap().is_none());
        for id in [&pending.id, &parent.id, &child.id] {
            assert!(storage.get_job(id).await.unwrap().is_some());
        }
    }
}
