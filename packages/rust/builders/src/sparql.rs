//! `sparql` model: articles linked from a Wikidata query.

use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};
use wikiselect_shared::{Result, WikiSelectError};

use crate::{BuilderModel, FieldError, Validation, normalize_title};

static VARIABLE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"));

/// Articles bound to `params.queryVariable` in the results of `params.query`.
#[derive(Debug, Clone)]
pub struct SparqlModel {
    client: Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct SparqlResponse {
    results: SparqlResults,
}

#[derive(Debug, Deserialize)]
struct SparqlResults {
    bindings: Vec<serde_json::Map<String, Value>>,
}

impl SparqlModel {
    pub fn new(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    /// Run the query and return the raw values bound to `variable`.
    async fn query(&self, query: &str, variable: &str) -> Result<Vec<String>> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::ACCEPT, "application/sparql-results+json")
            .form(&[("query", query), ("format", "json")])
            .send()
            .await
            .map_err(|e| WikiSelectError::upstream(format!("{}: {e}", self.endpoint)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(WikiSelectError::upstream(format!(
                "{}: HTTP {status}",
                self.endpoint
            )));
        }

        let body: SparqlResponse = response.json().await.map_err(|e| {
            WikiSelectError::upstream(format!("{}: invalid SPARQL response: {e}", self.endpoint))
        })?;

        Ok(body
            .results
            .bindings
            .iter()
            .filter_map(|binding| binding.get(variable)?.get("value")?.as_str())
            .map(str::to_string)
            .collect())
    }
}

/// Split out the variable name, with or without its leading `?`.
fn variable_name(params: &Value) -> Option<&str> {
    params
        .get("queryVariable")
        .and_then(Value::as_str)
        .map(|v| v.trim().trim_start_matches('?'))
        .filter(|v| !v.is_empty())
}

/// Whether `?name` occurs in `query` as a whole variable.
fn mentions_variable(query: &str, name: &str) -> bool {
    let pattern = format!(r"\?{}\b", regex::escape(name));
    Regex::new(&pattern)
        .map(|re| re.is_match(query))
        .unwrap_or(false)
}

#[async_trait]
impl BuilderModel for SparqlModel {
    fn tag(&self) -> &'static str {
        "sparql"
    }

    fn validate(&self, _project: &str, params: &Value) -> Validation {
        let mut validation = Validation::default();

        let query = params
            .get("query")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|q| !q.is_empty());
        if query.is_none() {
            validation
                .errors
                .push(FieldError::new("query", "A SPARQL query is required"));
        }

        match variable_name(params) {
            None => validation
                .errors
                .push(FieldError::new("queryVariable", "A query variable is required")),
            Some(name) if !VARIABLE_NAME.is_match(name) => {
                validation.rejected.push(name.to_string());
                validation.errors.push(FieldError::new(
                    "queryVariable",
                    format!("'{name}' is not a valid variable name"),
                ));
            }
            Some(name) => {
                if let Some(query) = query {
                    if !mentions_variable(query, name) {
                        validation.errors.push(FieldError::new(
                            "queryVariable",
                            format!("The query variable ?{name} does not appear in the query"),
                        ));
                    }
                }
            }
        }

        if let (Some(query), true) = (query, validation.is_valid()) {
            validation.accepted.push(query.to_string());
        }
        validation
    }

    #[instrument(skip_all, fields(project = %project))]
    async fn materialize(&self, project: &str, params: &Value) -> Result<Vec<String>> {
        let query = self
            .validate(project, params)
            .into_result()?
            .into_iter()
            .next()
            .ok_or_else(|| WikiSelectError::validation("query: A SPARQL query is required"))?;
        let variable = variable_name(params)
            .ok_or_else(|| WikiSelectError::validation("queryVariable: required"))?;

        let prefixes = [
            format!("https://{project}/wiki/"),
            format!("http://{project}/wiki/"),
        ];
        let mut titles = Vec::new();
        let mut seen = HashSet::new();
        for value in self.query(&query, variable).await? {
            // Only article URLs of the builder's project are selected.
            if !prefixes.iter().any(|p| value.starts_with(p.as_str())) {
                continue;
            }
            let title = normalize_title(&value, project);
            if !title.is_empty() && seen.insert(title.clone()) {
                titles.push(title);
            }
        }

        debug!(count = titles.len(), "sparql query materialized");
        Ok(titles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PROJECT: &str = "en.wikipedia.org";

    fn model(endpoint: &str) -> SparqlModel {
        SparqlModel::new(Client::new(), endpoint)
    }

    #[test]
    fn validates_query_and_variable() {
        let m = model("http://unused");
        let query = "SELECT ?article WHERE { ?item wdt:P31 wd:Q5 . ?article schema:about ?item }";

        let ok = m.validate(PROJECT, &json!({"query": query, "queryVariable": "?article"}));
        assert!(ok.is_valid(), "{:?}", ok.errors);
        assert_eq!(ok.accepted, vec![query]);

        let ok = m.validate(PROJECT, &json!({"query": query, "queryVariable": "article"}));
        assert!(ok.is_valid());

        let missing = m.validate(PROJECT, &json!({"query": query, "queryVariable": "art"}));
        assert_eq!(missing.errors[0].field, "queryVariable");
        assert!(missing.accepted.is_empty());

        let bad = m.validate(PROJECT, &json!({"query": query, "queryVariable": "a-b"}));
        assert_eq!(bad.rejected, vec!["a-b"]);

        let empty = m.validate(PROJECT, &json!({}));
        assert_eq!(empty.errors.len(), 2);
    }

    #[tokio::test]
    async fn materialize_extracts_project_articles() {
        let server = MockServer::start().await;
        let body = json!({
            "head": {"vars": ["article"]},
            "results": {"bindings": [
                {"article": {"type": "uri", "value": "https://en.wikipedia.org/wiki/Marie_Curie"}},
                {"article": {"type": "uri", "value": "https://en.wikipedia.org/wiki/Niels%20Bohr"}},
                {"article": {"type": "uri", "value": "https://fr.wikipedia.org/wiki/Marie_Curie"}},
                {"other": {"type": "uri", "value": "https://en.wikipedia.org/wiki/Ignored"}},
            ]}
        });
        Mock::given(method("POST"))
            .and(body_string_contains("format=json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let titles = model(&server.uri())
            .materialize(
                PROJECT,
                &json!({"query": "SELECT ?article WHERE {}", "queryVariable": "article"}),
            )
            .await
            .unwrap();
        assert_eq!(titles, vec!["Marie_Curie", "Niels_Bohr"]);
    }

    #[tokio::test]
    async fn endpoint_failure_is_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = model(&server.uri())
            .materialize(
                PROJECT,
                &json!({"query": "SELECT ?a WHERE {}", "queryVariable": "a"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WikiSelectError::Upstream { .. }), "got {err}");
    }
}
