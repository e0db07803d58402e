//! Wiring of storage, broker and external collaborators.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use wikiselect_artifacts::{ArtifactStore, LocalArtifactStore};
use wikiselect_builders::ModelRegistry;
use wikiselect_queue::{DbJobQueue, JobQueue, RateLimitedQueue};
use wikiselect_shared::{AppConfig, MailProvider, Result, expand_home, read_secret};
use wikiselect_storage::Storage;

use crate::archive::ArchiveTaskTracker;
use crate::builders::BuilderService;
use crate::farm::{ArchiveBuildService, HttpArchiveService};
use crate::mail::{LogMailer, MailgunMailer, Mailer};
use crate::materialize::Materializer;
use crate::orchestrator::PipelineOrchestrator;
use crate::scheduler::RecurrenceScheduler;
use crate::selections::SelectionService;

/// Shared handles used by every service.
pub struct AppContext {
    pub config: AppConfig,
    pub storage: Arc<Storage>,
    /// Rate-limited broker; the only queue instance in this process.
    pub queue: Arc<dyn JobQueue>,
    pub models: ModelRegistry,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub archive_service: Arc<dyn ArchiveBuildService>,
    pub mailer: Arc<dyn Mailer>,
}

impl AppContext {
    /// Open the database and build every collaborator from `config`.
    pub async fn open(config: AppConfig) -> Result<Self> {
        let db_path = expand_home(&config.database.path)?;
        let storage = Arc::new(
            Storage::open_with_retry(
                &db_path,
                config.database.connect_attempts,
                config.database.connect_retry_delay(),
            )
            .await?,
        );
        info!(path = %db_path.display(), "database ready");

        let artifacts = Arc::new(LocalArtifactStore::new(
            expand_home(&config.artifacts.root_dir)?,
            config.artifacts.public_base_url.clone(),
        ));

        let token = match read_secret(&config.archive.token_env) {
            Ok(token) => Some(token),
            Err(_) => {
                warn!(env = %config.archive.token_env, "no build service token set");
                None
            }
        };
        let archive_service = Arc::new(HttpArchiveService::new(
            config.archive.service_url.clone(),
            token,
            Duration::from_secs(config.archive.timeout_secs),
        )?);

        let mailer: Arc<dyn Mailer> = match config.mail.provider {
            MailProvider::Log => Arc::new(LogMailer),
            MailProvider::Mailgun => Arc::new(MailgunMailer::new(
                config.mail.api_url.clone(),
                read_secret(&config.mail.api_key_env)?,
                config.mail.from.clone(),
                Duration::from_secs(config.archive.timeout_secs),
            )?),
        };

        Self::with_collaborators(config, storage, artifacts, archive_service, mailer)
    }

    /// Assemble a context around already-built collaborators.
    pub fn with_collaborators(
        config: AppConfig,
        storage: Arc<Storage>,
        artifacts: Arc<dyn ArtifactStore>,
        archive_service: Arc<dyn ArchiveBuildService>,
        mailer: Arc<dyn Mailer>,
    ) -> Result<Self> {
        let queue = Arc::new(RateLimitedQueue::new(
            DbJobQueue::new(storage.clone(), config.queue.poll_interval()),
            config.queue.min_dequeue_interval(),
        ));
        let models = ModelRegistry::new(&config.models)?;
        Ok(Self {
            config,
            storage,
            queue,
            models,
            artifacts,
            archive_service,
            mailer,
        })
    }

    pub fn builders(&self) -> BuilderService<'_> {
        BuilderService::new(self)
    }

    pub fn selections(&self) -> SelectionService<'_> {
        SelectionService::new(self)
    }

    pub fn materializer(&self) -> Materializer<'_> {
        Materializer::new(self)
    }

    pub fn orchestrator(&self) -> PipelineOrchestrator<'_> {
        PipelineOrchestrator::new(self)
    }

    pub fn archive_tracker(&self) -> ArchiveTaskTracker<'_> {
        ArchiveTaskTracker::new(self)
    }

    pub fn scheduler(&self) -> RecurrenceScheduler<'_> {
        RecurrenceScheduler::new(self)
    }
}
