//! Job queue abstraction and its implementations.
//!
//! [`JobQueue`] is the broker interface the pipeline talks to. [`DbJobQueue`]
//! keeps jobs in the shared relational store so several worker processes can
//! consume the same queues; [`RateLimitedQueue`] wraps any queue and spaces
//! out successful hand-offs.

mod db;
mod rate_limit;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use wikiselect_shared::{JobRecord, JobStatus, Result};

pub use db::DbJobQueue;
pub use rate_limit::RateLimitedQueue;
pub use wikiselect_storage::NewJob;

/// Broker operations used by the pipeline and the workers.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job. Its initial state follows from `depends_on` and `run_at`.
    async fn enqueue(&self, job: NewJob) -> Result<JobRecord>;

    /// Take the next eligible job from the first non-empty queue in `queues`,
    /// waiting up to `timeout` for one to appear.
    async fn dequeue_any(&self, queues: &[&str], timeout: Duration) -> Result<Option<JobRecord>>;

    /// Mark a started job finished with an optional result, releasing its dependents.
    async fn complete(&self, job_id: &str, result: Option<&Value>) -> Result<()>;

    /// Mark a started job failed, cancelling its dependents.
    async fn fail(&self, job_id: &str, error: &str) -> Result<()>;

    /// Cancel a job that has not started. Returns `false` if it already ran.
    async fn cancel(&self, job_id: &str) -> Result<bool>;

    async fn status(&self, job_id: &str) -> Result<Option<JobStatus>>;

    /// Result recorded by a finished job.
    async fn result(&self, job_id: &str) -> Result<Option<Value>>;
}
