//! Core domain types for WikiSelect builders, selections, archives and schedules.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Content type of the tab-separated article lists produced by materialization.
pub const TSV_CONTENT_TYPE: &str = "text/tab-separated-values";

/// Generate a new time-sortable identifier (UUID v7).
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// A named, user-owned specification for selecting articles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Builder {
    /// Stable identifier (UUID v7).
    pub id: String,
    /// User that owns the builder.
    pub owner_id: String,
    /// Human-readable name; also used as the artifact file name.
    pub name: String,
    /// Wiki project, e.g. `en.wikipedia.org`.
    pub project: String,
    /// Model tag selecting the validator/materializer.
    pub model: String,
    /// Model-specific parameters.
    pub params: serde_json::Value,
    /// Latest materialized version (0 before the first run).
    pub current_version: i64,
    /// Last version for which an archive export was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_archive_version: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Outcome of a materialization attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelectionStatus {
    Ok,
    Error,
}

impl fmt::Display for SelectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

impl FromStr for SelectionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(Self::Ok),
            "ERROR" => Ok(Self::Error),
            _ => Err(format!("invalid selection status: {s}")),
        }
    }
}

/// One materialized artifact of a builder at a specific version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Selection {
    pub id: String,
    pub builder_id: String,
    pub content_type: String,
    /// Dense, per `(builder_id, content_type)`, starting at 1.
    pub version: i64,
    pub storage_key: String,
    pub status: SelectionStatus,
    /// Non-empty iff `status` is `Error`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_messages: Vec<String>,
    pub article_count: u64,
    /// SHA-256 of the stored artifact bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A selection row waiting for its version number.
#[derive(Debug, Clone)]
pub struct NewSelection {
    pub id: String,
    pub builder_id: String,
    pub content_type: String,
    pub storage_key: String,
    pub status: SelectionStatus,
    pub error_messages: Vec<String>,
    pub article_count: u64,
    pub content_hash: Option<String>,
}

impl NewSelection {
    /// Attach a version, producing the row to insert.
    pub fn with_version(self, version: i64) -> Selection {
        Selection {
            id: self.id,
            builder_id: self.builder_id,
            content_type: self.content_type,
            version,
            storage_key: self.storage_key,
            status: self.status,
            error_messages: self.error_messages,
            article_count: self.article_count,
            content_hash: self.content_hash,
            updated_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// ArchiveTask
// ---------------------------------------------------------------------------

/// Lifecycle of an archive build request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArchiveStatus {
    /// Created but never handed to the build service.
    NotRequested,
    /// Accepted for submission; waiting on the build service.
    Requested,
    Completed,
    Failed,
}

impl ArchiveStatus {
    /// Terminal states are set only from build service signals (or a rejected submission).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ArchiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRequested => write!(f, "NOT_REQUESTED"),
            Self::Requested => write!(f, "REQUESTED"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

impl FromStr for ArchiveStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NOT_REQUESTED" => Ok(Self::NotRequested),
            "REQUESTED" => Ok(Self::Requested),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("invalid archive status: {s}")),
        }
    }
}

/// One attempt to convert a selection into an archive file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveTask {
    pub id: String,
    pub selection_id: String,
    pub status: ArchiveStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_task_id: Option<String>,
    /// Triggering schedule, if any. Not a foreign key: schedules may be deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// RecurrenceSchedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleStatus {
    Active,
    /// Generation budget used up; the timer job has been cancelled.
    Exhausted,
    /// Cancelled by its owner.
    Cancelled,
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Exhausted => write!(f, "EXHAUSTED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

impl FromStr for ScheduleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "EXHAUSTED" => Ok(Self::Exhausted),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(format!("invalid schedule status: {s}")),
        }
    }
}

/// Subscription state of a schedule's notification address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailState {
    None,
    PendingConfirmation,
    Confirmed,
}

/// A standing instruction to regenerate and export a builder's artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurrenceSchedule {
    pub id: String,
    pub builder_id: String,
    /// Broker id of the armed timer job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_job_id: Option<String>,
    /// Seconds between firings; `None` means one-shot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<i64>,
    /// `None` means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_generations: Option<i64>,
    pub status: ScheduleStatus,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Single-use; cleared once the address is confirmed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_confirmation_token: Option<String>,
    #[serde(default)]
    pub email_confirmed: bool,
    /// Token for the unsubscribe link in notification mails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsubscribe_token: Option<String>,
    /// Why the last firing could not enqueue its run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub last_updated_at: DateTime<Utc>,
}

impl RecurrenceSchedule {
    pub fn interval(&self) -> Option<chrono::Duration> {
        self.interval_secs.map(chrono::Duration::seconds)
    }

    pub fn email_state(&self) -> EmailState {
        match (&self.email, self.email_confirmed) {
            (None, _) => EmailState::None,
            (Some(_), false) => EmailState::PendingConfirmation,
            (Some(_), true) => EmailState::Confirmed,
        }
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Broker-side state of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Eligible for dequeue.
    Queued,
    /// Waiting on its dependency to finish.
    Deferred,
    /// Eligible once `run_at` has passed.
    Scheduled,
    Started,
    Finished,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Deferred => write!(f, "deferred"),
            Self::Scheduled => write!(f, "scheduled"),
            Self::Started => write!(f, "started"),
            Self::Finished => write!(f, "finished"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "deferred" => Ok(Self::Deferred),
            "scheduled" => Ok(Self::Scheduled),
            "started" => Ok(Self::Started),
            "finished" => Ok(Self::Finished),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            _ => Err(format!("invalid job status: {s}")),
        }
    }
}

/// A job as stored by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub queue: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Output recorded when the job finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}
