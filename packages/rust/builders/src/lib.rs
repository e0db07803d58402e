//! Builder models: parameter validation and article list materialization.
//!
//! Every builder names a model by tag. The set of models is closed and known
//! at compile time; [`ModelRegistry`] maps a tag to its implementation and
//! reports an unknown tag as a configuration error.

mod petscan;
mod simple;
mod sparql;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use wikiselect_shared::{ModelsConfig, Result, WikiSelectError};

pub use petscan::PetscanModel;
pub use simple::SimpleModel;
pub use sparql::SparqlModel;

/// User-Agent string for outgoing article source requests.
const USER_AGENT: &str = concat!("WikiSelect/", env!("CARGO_PKG_VERSION"));

/// A problem with one builder parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Outcome of validating builder parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Validation {
    /// Normalized values the model will use.
    pub accepted: Vec<String>,
    /// Input values that were refused.
    pub rejected: Vec<String>,
    pub errors: Vec<FieldError>,
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Collapse the field errors into one validation error, or pass the accepted values through.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            return Ok(self.accepted);
        }
        let message = self
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect::<Vec<_>>()
            .join("; ");
        Err(WikiSelectError::validation(message))
    }
}

/// One kind of builder.
#[async_trait]
pub trait BuilderModel: Send + Sync {
    /// Tag stored on the builder record.
    fn tag(&self) -> &'static str;

    /// Check `params` for `project`. Never fails on bad user input; problems
    /// are reported in the returned [`Validation`].
    fn validate(&self, project: &str, params: &Value) -> Validation;

    /// Produce the article titles the builder currently selects.
    async fn materialize(&self, project: &str, params: &Value) -> Result<Vec<String>>;
}

/// Closed tag → model mapping.
#[derive(Clone)]
pub struct ModelRegistry {
    models: Vec<Arc<dyn BuilderModel>>,
}

impl ModelRegistry {
    /// Build the registry with the `simple`, `sparql` and `petscan` models.
    pub fn new(config: &ModelsConfig) -> Result<Self> {
        let client = build_client(Duration::from_secs(config.http_timeout_secs))?;
        Ok(Self {
            models: vec![
                Arc::new(SimpleModel),
                Arc::new(SparqlModel::new(client.clone(), config.sparql_endpoint.clone())),
                Arc::new(PetscanModel::new(client)),
            ],
        })
    }

    /// Look up a model by tag.
    pub fn get(&self, tag: &str) -> Result<Arc<dyn BuilderModel>> {
        self.models
            .iter()
            .find(|m| m.tag() == tag)
            .cloned()
            .ok_or_else(|| WikiSelectError::config(format!("unknown model tag '{tag}'")))
    }

    pub fn tags(&self) -> Vec<&'static str> {
        self.models.iter().map(|m| m.tag()).collect()
    }

    /// Validate `params` with the model registered under `tag`.
    pub fn validate(&self, tag: &str, project: &str, params: &Value) -> Result<Validation> {
        Ok(self.get(tag)?.validate(project, params))
    }
}

/// Build a reqwest client for article sources.
fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .map_err(|e| WikiSelectError::config(format!("failed to build HTTP client: {e}")))
}

/// Turn an article URL or title into a canonical title.
///
/// Strips a leading `https://{project}/wiki/` (percent-decoding what follows)
/// and replaces spaces with underscores.
pub(crate) fn normalize_title(raw: &str, project: &str) -> String {
    let trimmed = raw.trim();
    let title = ["https://", "http://"]
        .iter()
        .find_map(|scheme| trimmed.strip_prefix(&format!("{scheme}{project}/wiki/")))
        .map(|rest| {
            urlencoding::decode(rest)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| rest.to_string())
        })
        .unwrap_or_else(|| trimmed.to_string());
    title.replace(' ', "_")
}
