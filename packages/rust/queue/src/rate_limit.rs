//! Minimum spacing between job hand-offs.
//!
//! The limiter state lives in this process only. Workers in different
//! processes each enforce their own interval.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;
use wikiselect_shared::{JobRecord, JobStatus, Result};

use crate::{JobQueue, NewJob};

/// Wraps a [`JobQueue`] so that two successful dequeues through the same
/// instance are at least `min_interval` apart.
///
/// A caller that gets a job too early is put to sleep for the remainder of
/// the interval. Dequeues that return nothing leave the clock untouched.
/// Waiters are not served in any particular order.
pub struct RateLimitedQueue<Q> {
    inner: Q,
    min_interval: Duration,
    last_handoff: Mutex<Option<Instant>>,
}

impl<Q: JobQueue> RateLimitedQueue<Q> {
    pub fn new(inner: Q, min_interval: Duration) -> Self {
        Self {
            inner,
            min_interval,
            last_handoff: Mutex::new(None),
        }
    }

    pub fn inner(&self) -> &Q {
        &self.inner
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}

#[async_trait]
impl<Q: JobQueue> JobQueue for RateLimitedQueue<Q> {
    async fn enqueue(&self, job: NewJob) -> Result<JobRecord> {
        self.inner.enqueue(job).await
    }

    async fn dequeue_any(&self, queues: &[&str], timeout: Duration) -> Result<Option<JobRecord>> {
        let mut last_handoff = self.last_handoff.lock().await;

        let Some(job) = self.inner.dequeue_any(queues, timeout).await? else {
            return Ok(None);
        };

        if let Some(previous) = *last_handoff {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                let wait = self.min_interval - elapsed;
                debug!(job_id = %job.id, wait_ms = wait.as_millis() as u64, "rate limiting dequeue");
                tokio::time::sleep(wait).await;
            }
        }
        *last_handoff = Some(Instant::now());
        Ok(Some(job))
    }

    async fn complete(&self, job_id: &str, result: Option<&Value>) -> Result<()> {
        self.inner.complete(job_id, result).await
    }

    async fn fail(&self, job_id: &str, error: &str) -> Result<()> {
        self.inner.fail(job_id, error).await
    }

    async fn cancel(&self, job_id: &str) -> Result<bool> {
        self.inner.cancel(job_id).await
    }

    async fn status(&self, job_id: &str) -> Result<Option<JobStatus>> {
        self.inner.status(job_id).await
    }

    async fn result(&self, job_id: &str) -> Result<Option<Value>> {
        self.inner.result(job_id).await
    }
}
