//! Shared types, error model, and configuration for WikiSelect.
//!
//! This crate is the foundation depended on by all other WikiSelect crates.
//! It provides:
//! - [`WikiSelectError`] as the unified error type
//! - Domain types ([`Builder`], [`Selection`], [`ArchiveTask`], [`RecurrenceSchedule`], [`JobRecord`])
//! - Configuration ([`AppConfig`] and its sections, config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, AppSection, ArchiveConfig, ArtifactsConfig, DatabaseConfig, Environment,
    MailConfig, MailProvider, ModelsConfig, QueueConfig, config_dir, config_file_path,
    expand_home, init_config, load_config, load_config_from, read_secret,
};
pub use error::{Result, WikiSelectError};
pub use types::{
    ArchiveStatus, ArchiveTask, Builder, EmailState, JobRecord, JobStatus, NewSelection,
    RecurrenceSchedule, ScheduleStatus, Selection, SelectionStatus, TSV_CONTENT_TYPE, new_id,
};
