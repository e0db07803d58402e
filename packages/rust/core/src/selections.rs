//! Read access to selections and explicit pruning.

use tracing::{info, warn};
use wikiselect_shared::{Result, Selection, WikiSelectError};

use crate::builders::owned_builder;
use crate::context::AppContext;

pub struct SelectionService<'a> {
    ctx: &'a AppContext,
}

impl<'a> SelectionService<'a> {
    pub fn new(ctx: &'a AppContext) -> Self {
        Self { ctx }
    }

    pub async fn list(&self, builder_id: &str) -> Result<Vec<Selection>> {
        self.ctx.storage.list_selections(builder_id).await
    }

    pub async fn get(&self, selection_id: &str) -> Result<Selection> {
        self.ctx
            .storage
            .get_selection(selection_id)
            .await?
            .ok_or_else(|| WikiSelectError::not_found(format!("selection {selection_id}")))
    }

    pub async fn latest(&self, builder_id: &str, content_type: &str) -> Result<Option<Selection>> {
        self.ctx.storage.latest_selection(builder_id, content_type).await
    }

    /// Public download URL of a selection's artifact.
    pub async fn public_url(&self, selection_id: &str) -> Result<String> {
        let selection = self.get(selection_id).await?;
        Ok(self.ctx.artifacts.public_url(&selection.storage_key))
    }

    /// Keep the newest `keep` versions of each content type and delete the rest.
    pub async fn prune(&self, actor: &str, builder_id: &str, keep: u32) -> Result<Vec<Selection>> {
        owned_builder(&self.ctx.storage, actor, builder_id).await?;
        let pruned = self.ctx.storage.prune_selections(builder_id, keep).await?;
        for selection in &pruned {
            if let Err(e) = self.ctx.artifacts.delete(&selection.storage_key).await {
                warn!(key = %selection.storage_key, error = %e, "failed to delete artifact");
            }
        }
        info!(builder_id, keep, pruned = pruned.len(), "pruned selections");
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::*;
    use serde_json::json;
    use wikiselect_shared::WikiSelectError;

    #[tokio::test]
    async fn prune_removes_old_versions_and_their_artifacts() {
        let harness = Harness::new().await;
        let builder = harness.builder("alice", json!({"list": ["Photon"]})).await;
        let mut made = Vec::new();
        for _ in 0..3 {
            made.push(harness.ctx.materializer().run(&builder.id).await.unwrap());
        }

        let selections = harness.ctx.selections();
        let err = selections.prune("bob", &builder.id, 1).await.unwrap_err();
        assert!(matches!(err, WikiSelectError::Authorization { .. }));

        let pruned = selections.prune("alice", &builder.id, 1).await.unwrap();
        assert_eq!(pruned.len(), 2);
        for old in &made[..2] {
            assert!(harness.ctx.artifacts.get(&old.storage_key).await.unwrap().is_none());
        }
        let remaining = selections.list(&builder.id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].version, 3);
    }

    #[tokio::test]
    async fn public_url_points_at_artifact() {
        let harness = Harness::new().await;
        let builder = harness.builder("alice", json!({"list": ["Photon"]})).await;
        let selection = harness.ctx.materializer().run(&builder.id).await.unwrap();

        let url = harness.ctx.selections().public_url(&selection.id).await.unwrap();
        assert!(url.starts_with("http://localhost:8000/artifacts/selections/simple/"));
        assert!(url.ends_with(".tsv"));
    }
}
