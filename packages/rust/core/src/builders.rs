//! Builder lifecycle: create, update, delete, list.

use chrono::Utc;
use serde_json::Value;
use tracing::{info, instrument, warn};
use wikiselect_builders::Validation;
use wikiselect_shared::{Builder, Result, WikiSelectError, new_id};
use wikiselect_storage::Storage;

use crate::context::AppContext;

/// User-supplied builder definition.
#[derive(Debug, Clone)]
pub struct BuilderDraft {
    pub name: String,
    pub project: String,
    pub model: String,
    pub params: Value,
}

pub struct BuilderService<'a> {
    ctx: &'a AppContext,
}

/// Load a builder and check that `actor` owns it.
pub(crate) async fn owned_builder(storage: &Storage, actor: &str, builder_id: &str) -> Result<Builder> {
    let builder = storage
        .get_builder(builder_id)
        .await?
        .ok_or_else(|| WikiSelectError::not_found(format!("builder {builder_id}")))?;
    if builder.owner_id != actor {
        return Err(WikiSelectError::authorization(format!(
            "{actor} does not own builder {builder_id}"
        )));
    }
    Ok(builder)
}

impl<'a> BuilderService<'a> {
    pub fn new(ctx: &'a AppContext) -> Self {
        Self { ctx }
    }

    /// Run the model validator without saving anything.
    pub fn check(&self, draft: &BuilderDraft) -> Result<Validation> {
        let mut validation = self
            .ctx
            .models
            .validate(&draft.model, draft.project.trim(), &draft.params)?;
        if draft.name.trim().is_empty() {
            validation
                .errors
                .push(wikiselect_builders::FieldError::new("name", "A name is required"));
        }
        if draft.project.trim().is_empty() {
            validation
                .errors
                .push(wikiselect_builders::FieldError::new("project", "A project is required"));
        }
        Ok(validation)
    }

    #[instrument(skip_all, fields(actor = %actor, model = %draft.model))]
    pub async fn create(&self, actor: &str, draft: BuilderDraft) -> Result<Builder> {
        self.check(&draft)?.into_result()?;

        let now = Utc::now();
        let builder = Builder {
            id: new_id(),
            owner_id: actor.to_string(),
            name: draft.name.trim().to_string(),
            project: draft.project.trim().to_string(),
            model: draft.model,
            params: draft.params,
            current_version: 0,
            selection_archive_version: None,
            created_at: now,
            updated_at: now,
        };
        self.ctx.storage.insert_builder(&builder).await?;
        info!(builder_id = %builder.id, "builder created");
        Ok(builder)
    }

    /// Replace a builder's definition. Existing selections are untouched.
    #[instrument(skip_all, fields(actor = %actor, builder_id = %builder_id))]
    pub async fn update(&self, actor: &str, builder_id: &str, draft: BuilderDraft) -> Result<Builder> {
        owned_builder(&self.ctx.storage, actor, builder_id).await?;
        self.check(&draft)?.into_result()?;

        self.ctx
            .storage
            .update_builder_definition(
                builder_id,
                draft.name.trim(),
                draft.project.trim(),
                &draft.model,
                &draft.params,
            )
            .await?;
        info!("builder updated");
        self.get(builder_id).await
    }

    /// Delete a builder with its selections, artifacts and schedules.
    ///
    /// Schedule timer jobs are cancelled first so nothing fires for a builder
    /// that no longer exists.
    #[instrument(skip_all, fields(actor = %actor, builder_id = %builder_id))]
    pub async fn delete(&self, actor: &str, builder_id: &str) -> Result<()> {
        owned_builder(&self.ctx.storage, actor, builder_id).await?;

        for schedule in self.ctx.storage.list_schedules(builder_id).await? {
            if let Some(job_id) = &schedule.queue_job_id {
                self.ctx.queue.cancel(job_id).await?;
            }
        }

        let selections = self.ctx.storage.list_selections(builder_id).await?;
        self.ctx.storage.delete_builder(builder_id).await?;

        for selection in &selections {
            if let Err(e) = self.ctx.artifacts.delete(&selection.storage_key).await {
                warn!(key = %selection.storage_key, error = %e, "failed to delete artifact");
            }
        }
        info!(selections = selections.len(), "builder deleted");
        Ok(())
    }

    pub async fn get(&self, builder_id: &str) -> Result<Builder> {
        self.ctx
            .storage
            .get_builder(builder_id)
            .await?
            .ok_or_else(|| WikiSelectError::not_found(format!("builder {builder_id}")))
    }

    pub async fn list(&self, owner: Option<&str>) -> Result<Vec<Builder>> {
        self.ctx.storage.list_builders(owner).await
    }
}
