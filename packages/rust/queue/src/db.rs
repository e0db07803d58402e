//! Job queue backed by the `jobs` table.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;
use wikiselect_shared::{JobRecord, JobStatus, Result};
use wikiselect_storage::{NewJob, Storage};

use crate::JobQueue;

/// Polls the relational store for eligible jobs.
#[derive(Clone)]
pub struct DbJobQueue {
    storage: Arc<Storage>,
    poll_interval: Duration,
}

impl DbJobQueue {
    pub fn new(storage: Arc<Storage>, poll_interval: Duration) -> Self {
        Self {
            storage,
            poll_interval,
        }
    }

    async fn claim_first(&self, queues: &[&str]) -> Result<Option<JobRecord>> {
        for queue in queues {
            if let Some(job) = self.storage.claim_next_job(queue).await? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl JobQueue for DbJobQueue {
    async fn enqueue(&self, job: NewJob) -> Result<JobRecord> {
        self.storage.enqueue_job(job).await
    }

    async fn dequeue_any(&self, queues: &[&str], timeout: Duration) -> Result<Option<JobRecord>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(job) = self.claim_first(queues).await? {
                debug!(job_id = %job.id, queue = %job.queue, "dequeued job");
                return Ok(Some(job));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn complete(&self, job_id: &str, result: Option<&Value>) -> Result<()> {
        self.storage.finish_job(job_id, result).await
    }

    async fn fail(&self, job_id: &str, error: &str) -> Result<()> {
        self.storage.fail_job(job_id, error).await
    }

    async fn cancel(&self, job_id: &str) -> Result<bool> {
        self.storage.cancel_job(job_id).await
    }

    async fn status(&self, job_id: &str) -> Result<Option<JobStatus>> {
        Ok(self.storage.get_job(job_id).await?.map(|job| job.status))
    }

    async fn result(&self, job_id: &str) -> Result<Option<Value>> {
        Ok(self.storage.get_job(job_id).await?.and_then(|job| job.result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wikiselect_shared::new_id;

    async fn queue() -> DbJobQueue {
        let path = std::env::temp_dir().join(format!("ws_queue_{}.db", new_id()));
        let storage = Storage::open(&path).await.expect("open test db");
        DbJobQueue::new(Arc::new(storage), Duration::from_millis(20))
    }

    #[tokio::test]
    async fn dequeue_prefers_earlier_queues() {
        let q = queue().await;
        let export = q.enqueue(NewJob::new("export", json!({}))).await.unwrap();
        let materialize = q.enqueue(NewJob::new("materialize", json!({}))).await.unwrap();

        let timeout = Duration::from_millis(100);
        let first = q.dequeue_any(&["materialize", "export"], timeout).await.unwrap().unwrap();
        assert_eq!(first.id, materialize.id);
        let second = q.dequeue_any(&["materialize", "export"], timeout).await.unwrap().unwrap();
        assert_eq!(second.id, export.id);
    }

    #[tokio::test]
    async fn empty_dequeue_waits_for_timeout() {
        let q = queue().await;
        let started = Instant::now();
        let job = q
            .dequeue_any(&["materialize"], Duration::from_millis(150))
            .await
            .unwrap();
        assert!(job.is_none());
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn complete_releases_dependent() {
        let q = queue().await;
        let parent = q.enqueue(NewJob::new("materialize", json!({}))).await.unwrap();
        let child = q
            .enqueue(NewJob::new("export", json!({})).depends_on(&parent.id))
            .await
            .unwrap();
        assert_eq!(q.status(&child.id).await.unwrap(), Some(JobStatus::Deferred));

        let timeout = Duration::from_millis(50);
        let claimed = q.dequeue_any(&["materialize"], timeout).await.unwrap().unwrap();
        q.complete(&claimed.id, Some(&json!({"selection_id": "sel-1"})))
            .await
            .unwrap();
        assert_eq!(q.status(&child.id).await.unwrap(), Some(JobStatus::Queued));
        assert_eq!(q.status(&parent.id).await.unwrap(), Some(JobStatus::Finished));
        assert_eq!(
            q.result(&parent.id).await.unwrap(),
            Some(json!({"selection_id": "sel-1"}))
        );
    }

    #[tokio::test]
    async fn fail_cancels_dependent() {
        let q = queue().await;
        let parent = q.enqueue(NewJob::new("materialize", json!({}))).await.unwrap();
        let child = q
            .enqueue(NewJob::new("export", json!({})).depends_on(&parent.id))
            .await
            .unwrap();

        let claimed = q
            .dequeue_any(&["materialize"], Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        q.fail(&claimed.id, "boom").await.unwrap();
        assert_eq!(q.status(&child.id).await.unwrap(), Some(JobStatus::Canceled));
        assert!(
            q.dequeue_any(&["export"], Duration::from_millis(50))
                .await
                .unwrap()
                .is_none()
        );
    }
}
