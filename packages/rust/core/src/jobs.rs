//! Job payloads and queue names.

use serde::{Deserialize, Serialize};
use wikiselect_queue::NewJob;
use wikiselect_shared::{JobRecord, Result, WikiSelectError};

pub const SCHEDULE_QUEUE: &str = "schedules";
pub const MATERIALIZE_QUEUE: &str = "materialize";
pub const EXPORT_QUEUE: &str = "export";

/// Queues a worker serves, in priority order.
pub const ALL_QUEUES: [&str; 3] = [SCHEDULE_QUEUE, MATERIALIZE_QUEUE, EXPORT_QUEUE];

/// What a job asks the worker to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    /// Produce a new selection version for a builder.
    Materialize { builder_id: String },
    /// Request an archive build for the builder's latest selection.
    Export {
        builder_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schedule_id: Option<String>,
    },
    /// One firing of a recurrence schedule.
    FireSchedule { schedule_id: String },
}

impl JobPayload {
    pub fn queue(&self) -> &'static str {
        match self {
            Self::Materialize { .. } => MATERIALIZE_QUEUE,
            Self::Export { .. } => EXPORT_QUEUE,
            Self::FireSchedule { .. } => SCHEDULE_QUEUE,
        }
    }

    pub fn to_job(&self) -> Result<NewJob> {
        let payload = serde_json::to_value(self)
            .map_err(|e| WikiSelectError::Queue(format!("encode job payload: {e}")))?;
        Ok(NewJob::new(self.queue(), payload))
    }

    pub fn from_record(record: &JobRecord) -> Result<Self> {
        serde_json::from_value(record.payload.clone()).map_err(|e| {
            WikiSelectError::Queue(format!("job {} has an unreadable payload: {e}", record.id))
        })
    }
}
