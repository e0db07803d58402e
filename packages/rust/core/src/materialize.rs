//! Materialization: run a builder's model and record the result as a new selection.

use tracing::{error, info, instrument};
use wikiselect_artifacts::{content_hash, derive_key, render_tsv};
use wikiselect_shared::{
    Builder, NewSelection, Result, Selection, SelectionStatus, TSV_CONTENT_TYPE, WikiSelectError,
    new_id,
};

use crate::context::AppContext;

pub struct Materializer<'a> {
    ctx: &'a AppContext,
}

impl<'a> Materializer<'a> {
    pub fn new(ctx: &'a AppContext) -> Self {
        Self { ctx }
    }

    /// Produce the next selection version for `builder_id`.
    ///
    /// A failed attempt still consumes a version: an `ERROR` selection is
    /// recorded with the failure reason and the error is returned so the job
    /// (and anything chained after it) fails too.
    #[instrument(skip_all, fields(builder_id = %builder_id))]
    pub async fn run(&self, builder_id: &str) -> Result<Selection> {
        let builder = self
            .ctx
            .storage
            .get_builder(builder_id)
            .await?
            .ok_or_else(|| WikiSelectError::not_found(format!("builder {builder_id}")))?;
        let model = self.ctx.models.get(&builder.model)?;

        let titles = match model.materialize(&builder.project, &builder.params).await {
            Ok(titles) => titles,
            Err(e) => {
                let failed = self.record_failure(&builder, &e).await?;
                error!(version = failed.version, error = %e, "materialization failed");
                return Err(e);
            }
        };

        let bytes = render_tsv(&titles);
        let selection = self
            .ctx
            .storage
            .record_next_version(self.new_selection(
                &builder,
                SelectionStatus::Ok,
                Vec::new(),
                titles.len() as u64,
                Some(content_hash(&bytes)),
            ))
            .await?;

        if let Err(e) = self
            .ctx
            .artifacts
            .put(&selection.storage_key, &bytes, TSV_CONTENT_TYPE)
            .await
        {
            self.ctx
                .storage
                .mark_failed(&selection.id, &[format!("artifact upload failed: {e}")])
                .await?;
            self.ctx
                .storage
                .advance_current_version(&builder.id, selection.version)
                .await?;
            error!(version = selection.version, error = %e, "artifact upload failed");
            return Err(e);
        }

        self.ctx
            .storage
            .advance_current_version(&builder.id, selection.version)
            .await?;
        info!(
            version = selection.version,
            articles = selection.article_count,
            key = %selection.storage_key,
            "selection materialized"
        );
        Ok(selection)
    }

    async fn record_failure(&self, builder: &Builder, cause: &WikiSelectError) -> Result<Selection> {
        let selection = self
            .ctx
            .storage
            .record_next_version(self.new_selection(
                builder,
                SelectionStatus::Error,
                vec![cause.to_string()],
                0,
                None,
            ))
            .await?;
        self.ctx
            .storage
            .advance_current_version(&builder.id, selection.version)
            .await?;
        Ok(selection)
    }

    fn new_selection(
        &self,
        builder: &Builder,
        status: SelectionStatus,
        error_messages: Vec<String>,
        article_count: u64,
        content_hash: Option<String>,
    ) -> NewSelection {
        let id = new_id();
        NewSelection {
            storage_key: derive_key(&id, TSV_CONTENT_TYPE, &builder.model, Some(&builder.name)),
            id,
            builder_id: builder.id.clone(),
            content_type: TSV_CONTENT_TYPE.to_string(),
            status,
            error_messages,
            article_count,
            content_hash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::BuilderDraft;
    use crate::test_support::*;
    use serde_json::json;

    #[tokio::test]
    async fn each_run_makes_a_new_version_and_keeps_the_old_one() {
        let harness = Harness::new().await;
        let builder = harness.builder("alice", json!({"list": ["Photon", "Electron"]})).await;

        let v1 = harness.ctx.materializer().run(&builder.id).await.unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v1.status, SelectionStatus::Ok);
        assert_eq!(v1.article_count, 2);
        let v1_bytes = harness.ctx.artifacts.get(&v1.storage_key).await.unwrap().unwrap();
        assert_eq!(v1_bytes, b"Photon\nElectron\n");
        assert_eq!(v1.content_hash.as_deref(), Some(content_hash(&v1_bytes).as_str()));

        harness
            .ctx
            .builders()
            .update(
                "alice",
                &builder.id,
                BuilderDraft {
                    name: builder.name.clone(),
                    project: builder.project.clone(),
                    model: "simple".into(),
                    params: json!({"list": ["Neutron"]}),
                },
            )
            .await
            .unwrap();
        let v2 = harness.ctx.materializer().run(&builder.id).await.unwrap();
        assert_eq!(v2.version, 2);
        assert_ne!(v1.storage_key, v2.storage_key);

        let v1_again = harness.ctx.selections().get(&v1.id).await.unwrap();
        assert_eq!(v1_again.status, SelectionStatus::Ok);
        assert_eq!(v1_again.content_hash, v1.content_hash);
        assert_eq!(
            harness.ctx.artifacts.get(&v1.storage_key).await.unwrap().unwrap(),
            v1_bytes
        );

        let stored = harness.ctx.builders().get(&builder.id).await.unwrap();
        assert_eq!(stored.current_version, 2);
    }

    #[tokio::test]
    async fn failure_consumes_a_version() {
        let harness = Harness::new().await;
        let builder = harness.builder("alice", json!({"list": ["Photon"]})).await;
        // Params go bad after the builder was saved.
        harness
            .ctx
            .storage
            .update_builder_definition(&builder.id, "x", "en.wikipedia.org", "simple", &json!({}))
            .await
            .unwrap();

        let err = harness.ctx.materializer().run(&builder.id).await.unwrap_err();
        assert!(matches!(err, WikiSelectError::Validation { .. }));

        let selections = harness.ctx.selections().list(&builder.id).await.unwrap();
        assert_eq!(selections.len(), 1);
        assert_eq!(selections[0].version, 1);
        assert_eq!(selections[0].status, SelectionStatus::Error);
        assert!(selections[0].error_messages[0].contains("Empty list"));
        assert_eq!(
            harness.ctx.builders().get(&builder.id).await.unwrap().current_version,
            1
        );
    }

    #[tokio::test]
    async fn missing_builder_is_not_found() {
        let harness = Harness::new().await;
        let err = harness.ctx.materializer().run("missing").await.unwrap_err();
        assert!(matches!(err, WikiSelectError::NotFound { .. }));
    }
}
