//! Client for the external archive build service.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use wikiselect_shared::{Result, WikiSelectError};

const USER_AGENT: &str = concat!("WikiSelect/", env!("CARGO_PKG_VERSION"));

/// Everything the build service needs to produce an archive from a selection.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveRequest {
    pub selection_id: String,
    pub project: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub long_description: Option<String>,
    /// Public URL of the article list.
    pub article_list_url: String,
    pub article_count: u64,
}

/// Task state as reported by the build service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    /// Queued or building.
    Pending,
    Completed,
    Failed(Option<String>),
}

impl FromStr for RemoteStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "completed" | "succeeded" | "success" => Ok(Self::Completed),
            "failed" | "canceled" | "cancelled" => Ok(Self::Failed(None)),
            "requested" | "reserved" | "started" | "scraper_started" | "scraper_completed"
            | "pending" => Ok(Self::Pending),
            other => Err(format!("unknown archive task status: {other}")),
        }
    }
}

/// Submission and status interface of the build service.
#[async_trait]
pub trait ArchiveBuildService: Send + Sync {
    /// Submit a build. Returns the service's task id.
    async fn submit(&self, request: &ArchiveRequest) -> Result<String>;

    async fn status(&self, external_task_id: &str) -> Result<RemoteStatus>;
}

/// HTTP implementation: `POST {base}/tasks`, `GET {base}/tasks/{id}`.
#[derive(Debug, Clone)]
pub struct HttpArchiveService {
    client: Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    error: Option<String>,
}

impl HttpArchiveService {
    pub fn new(base_url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| WikiSelectError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Map a non-success submission response onto the error taxonomy.
fn submission_error(status: StatusCode, body: &str) -> WikiSelectError {
    let detail = if body.trim().is_empty() {
        status.to_string()
    } else {
        format!("{status}: {}", body.trim())
    };
    match status {
        StatusCode::PAYLOAD_TOO_LARGE => {
            WikiSelectError::capacity(format!("build service refused the export ({detail})"))
        }
        _ => WikiSelectError::upstream(format!("build service rejected the export ({detail})")),
    }
}

#[async_trait]
impl ArchiveBuildService for HttpArchiveService {
    #[instrument(skip_all, fields(selection_id = %request.selection_id))]
    async fn submit(&self, request: &ArchiveRequest) -> Result<String> {
        let url = format!("{}/tasks", self.base_url);
        let response = self
            .authorize(self.client.post(&url).json(request))
            .send()
            .await
            .map_err(|e| WikiSelectError::upstream(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(submission_error(status, &body));
        }

        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|e| WikiSelectError::upstream(format!("{url}: invalid response: {e}")))?;
        debug!(external_task_id = %body.id, "archive build submitted");
        Ok(body.id)
    }

    async fn status(&self, external_task_id: &str) -> Result<RemoteStatus> {
        let url = format!("{}/tasks/{external_task_id}", self.base_url);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| WikiSelectError::upstream(format!("{url}: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(WikiSelectError::not_found(format!(
                "build service task {external_task_id}"
            )));
        }
        if !status.is_success() {
            return Err(WikiSelectError::upstream(format!("{url}: HTTP {status}")));
        }

        let body: StatusResponse = response
            .json()
            .await
            .map_err(|e| WikiSelectError::upstream(format!("{url}: invalid response: {e}")))?;
        match body.status.parse::<RemoteStatus>() {
            Ok(RemoteStatus::Failed(_)) => Ok(RemoteStatus::Failed(body.error)),
            Ok(remote) => Ok(remote),
            Err(message) => Err(WikiSelectError::upstream(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ArchiveRequest {
        ArchiveRequest {
            selection_id: "sel-1".into(),
            project: "en.wikipedia.org".into(),
            title: "Physics".into(),
            description: None,
            long_description: None,
            article_list_url: "http://localhost/a.tsv".into(),
            article_count: 2,
        }
    }

    fn service(server: &MockServer) -> HttpArchiveService {
        HttpArchiveService::new(server.uri(), Some("secret".into()), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn submit_returns_task_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tasks"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "farm-42"})))
            .mount(&server)
            .await;

        let id = service(&server).submit(&request()).await.unwrap();
        assert_eq!(id, "farm-42");
    }

    #[tokio::test]
    async fn oversize_and_rejection_map_to_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(413).set_body_string("too many articles"))
            .mount(&server)
            .await;
        let err = service(&server).submit(&request()).await.unwrap_err();
        assert!(matches!(err, WikiSelectError::Capacity { .. }), "got {err}");
        assert!(err.to_string().contains("too many articles"));

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422))
            .mount(&server)
            .await;
        let err = service(&server).submit(&request()).await.unwrap_err();
        assert!(matches!(err, WikiSelectError::Upstream { .. }), "got {err}");
    }

    #[tokio::test]
    async fn status_is_parsed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tasks/farm-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "succeeded"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tasks/farm-2"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"status": "failed", "error": "scraper crashed"})),
            )
            .mount(&server)
            .await;

        let svc = service(&server);
        assert_eq!(svc.status("farm-1").await.unwrap(), RemoteStatus::Completed);
        assert_eq!(
            svc.status("farm-2").await.unwrap(),
            RemoteStatus::Failed(Some("scraper crashed".into()))
        );
        let err = svc.status("farm-3").await.unwrap_err();
        assert!(matches!(err, WikiSelectError::NotFound { .. }));
    }

    #[test]
    fn remote_status_strings() {
        assert_eq!("started".parse::<RemoteStatus>().unwrap(), RemoteStatus::Pending);
        assert_eq!("COMPLETED".parse::<RemoteStatus>().unwrap(), RemoteStatus::Completed);
        assert!("exploded".parse::<RemoteStatus>().is_err());
    }
}
