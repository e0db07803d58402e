//! Pipeline services for WikiSelect.
//!
//! Builders are materialized into versioned selections, selections are
//! exported to the archive build service, and recurrence schedules repeat
//! the whole run. Work is carried by jobs on the broker and executed by
//! [`Worker`].

pub mod archive;
pub mod builders;
pub mod context;
pub mod farm;
pub mod jobs;
pub mod mail;
pub mod materialize;
pub mod orchestrator;
pub mod scheduler;
pub mod selections;
pub mod worker;

pub use archive::{ArchiveTaskTracker, PollSummary, SilentProgress, WaitProgress};
pub use builders::{BuilderDraft, BuilderService};
pub use context::AppContext;
pub use farm::{ArchiveBuildService, ArchiveRequest, HttpArchiveService, RemoteStatus};
pub use jobs::JobPayload;
pub use mail::{LogMailer, MailMessage, Mailer, MailgunMailer};
pub use materialize::Materializer;
pub use orchestrator::{BuilderRun, PipelineOrchestrator};
pub use scheduler::{FireOutcome, NewSchedule, RecurrenceScheduler};
pub use selections::SelectionService;
pub use worker::{JobOutcome, Worker};
