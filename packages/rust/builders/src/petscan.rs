//! `petscan` model: the result of a saved PetScan query.

use std::collections::HashSet;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};
use url::Url;
use wikiselect_shared::{Result, WikiSelectError};

use crate::{BuilderModel, FieldError, Validation};

const ALLOWED_HOSTS: &[&str] = &["petscan.wmflabs.org", "petscan.wmcloud.org"];

const FIELD: &str = "url";

/// Articles listed by the PetScan query at `params.url`.
#[derive(Debug, Clone)]
pub struct PetscanModel {
    client: Client,
}

/// PetScan's JSON output: `{"*": [{"a": {"*": [{"title": ...}]}}]}`.
#[derive(Debug, Deserialize)]
struct PetscanResponse {
    #[serde(rename = "*", default)]
    sections: Vec<PetscanSection>,
}

#[derive(Debug, Deserialize)]
struct PetscanSection {
    a: PetscanPages,
}

#[derive(Debug, Deserialize)]
struct PetscanPages {
    #[serde(rename = "*", default)]
    pages: Vec<PetscanPage>,
}

#[derive(Debug, Deserialize)]
struct PetscanPage {
    title: String,
}

impl PetscanModel {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Fetch the query result as JSON and return its page titles.
    pub(crate) async fn fetch_titles(&self, url: &Url) -> Result<Vec<String>> {
        let mut url = url.clone();
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| k != "format" && k != "doit")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .append_pair("format", "json")
            .append_pair("doit", "1");

        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| WikiSelectError::upstream(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(WikiSelectError::upstream(format!("{url}: HTTP {status}")));
        }

        let body: PetscanResponse = response
            .json()
            .await
            .map_err(|e| WikiSelectError::upstream(format!("{url}: invalid PetScan response: {e}")))?;

        let mut titles: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for page in body.sections.into_iter().flat_map(|s| s.a.pages) {
            let title = page.title.replace(' ', "_");
            if !title.is_empty() && seen.insert(title.clone()) {
                titles.push(title);
            }
        }
        Ok(titles)
    }
}

#[async_trait]
impl BuilderModel for PetscanModel {
    fn tag(&self) -> &'static str {
        "petscan"
    }

    fn validate(&self, _project: &str, params: &Value) -> Validation {
        let mut validation = Validation::default();

        let Some(raw) = params
            .get(FIELD)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|u| !u.is_empty())
        else {
            validation
                .errors
                .push(FieldError::new(FIELD, "A PetScan URL is required"));
            return validation;
        };

        let url = match Url::parse(raw) {
            Ok(url) => url,
            Err(e) => {
                validation.rejected.push(raw.to_string());
                validation
                    .errors
                    .push(FieldError::new(FIELD, format!("Invalid URL: {e}")));
                return validation;
            }
        };

        let scheme_ok = matches!(url.scheme(), "http" | "https");
        let host_ok = url
            .host_str()
            .is_some_and(|host| ALLOWED_HOSTS.contains(&host));
        if scheme_ok && host_ok {
            validation.accepted.push(url.to_string());
        } else {
            validation.rejected.push(raw.to_string());
            validation.errors.push(FieldError::new(
                FIELD,
                format!("The URL must point to {}", ALLOWED_HOSTS.join(" or ")),
            ));
        }
        validation
    }

    #[instrument(skip_all, fields(project = %project))]
    async fn materialize(&self, project: &str, params: &Value) -> Result<Vec<String>> {
        let accepted = self.validate(project, params).into_result()?;
        let raw = accepted
            .first()
            .ok_or_else(|| WikiSelectError::validation("url: A PetScan URL is required"))?;
        let url = Url::parse(raw)
            .map_err(|e| WikiSelectError::validation(format!("url: Invalid URL: {e}")))?;

        let titles = self.fetch_titles(&url).await?;
        debug!(count = titles.len(), "petscan query materialized");
        Ok(titles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PROJECT: &str = "en.wikipedia.org";

    #[test]
    fn only_petscan_hosts_are_accepted() {
        let model = PetscanModel::new(Client::new());
        for url in [
            "https://petscan.wmflabs.org/?psid=123",
            "https://petscan.wmcloud.org/?psid=456",
        ] {
            let v = model.validate(PROJECT, &json!({ "url": url }));
            assert!(v.is_valid(), "{url}: {:?}", v.errors);
            assert_eq!(v.accepted.len(), 1);
        }

        for url in ["https://example.org/?psid=1", "ftp://petscan.wmflabs.org/", "not a url"] {
            let v = model.validate(PROJECT, &json!({ "url": url }));
            assert!(!v.is_valid(), "{url} should be rejected");
            assert_eq!(v.rejected, vec![url]);
        }

        assert!(!model.validate(PROJECT, &json!({})).is_valid());
    }

    #[tokio::test]
    async fn fetch_titles_reads_json_output() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .and(query_param("psid", "123"))
            .and(query_param("format", "json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "n": "result",
                "*": [{"n": "combination", "a": {"type": "union", "*": [
                    {"id": 1, "title": "Marie_Curie", "namespace": 0},
                    {"id": 2, "title": "Niels Bohr", "namespace": 0},
                ]}}]
            })))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/?psid=123&format=html", server.uri())).unwrap();
        let titles = PetscanModel::new(Client::new())
            .fetch_titles(&url)
            .await
            .unwrap();
        assert_eq!(titles, vec!["Marie_Curie", "Niels_Bohr"]);
    }

    #[tokio::test]
    async fn fetch_titles_dedups_large_results_in_order() {
        let mut pages: Vec<Value> = (0..120_000)
            .map(|i| json!({"id": i, "title": format!("Page {i}"), "namespace": 0}))
            .collect();
        pages.push(json!({"id": 0, "title": "Page_0", "namespace": 0}));
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "n": "result",
                "*": [{"n": "combination", "a": {"type": "union", "*": pages}}]
            })))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/?psid=1", server.uri())).unwrap();
        let titles = PetscanModel::new(Client::new())
            .fetch_titles(&url)
            .await
            .unwrap();
        assert_eq!(titles.len(), 120_000);
        assert_eq!(titles[0], "Page_0");
        assert_eq!(titles[119_999], "Page_119999");
    }

    #[tokio::test]
    async fn server_error_is_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/?psid=1", server.uri())).unwrap();
        let err = PetscanModel::new(Client::new())
            .fetch_titles(&url)
            .await
            .unwrap_err();
        assert!(matches!(err, WikiSelectError::Upstream { .. }));
    }
}
