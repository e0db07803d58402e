//! Application configuration for WikiSelect.
//!
//! User config lives at `~/.wikiselect/wikiselect.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WikiSelectError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "wikiselect.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".wikiselect";

// ---------------------------------------------------------------------------
// Config structs (matching wikiselect.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Operating mode and public URLs.
    #[serde(default)]
    pub app: AppSection,

    /// Relational store settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Job broker and worker throttling.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Artifact storage.
    #[serde(default)]
    pub artifacts: ArtifactsConfig,

    /// External archive build service.
    #[serde(default)]
    pub archive: ArchiveConfig,

    /// Mail delivery.
    #[serde(default)]
    pub mail: MailConfig,

    /// Builder model settings.
    #[serde(default)]
    pub models: ModelsConfig,
}

/// Operating mode. Archive exports are only enqueued in production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

/// `[app]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSection {
    #[serde(default)]
    pub environment: Environment,

    /// Base URL used to build confirmation and unsubscribe links.
    #[serde(default = "default_web_base_url")]
    pub web_base_url: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            web_base_url: default_web_base_url(),
        }
    }
}

impl AppSection {
    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }
}

fn default_web_base_url() -> String {
    "http://localhost:5000".into()
}

/// `[database]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the libSQL database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Attempts made when opening the database before giving up.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Fixed delay between connection attempts.
    #[serde(default = "default_connect_retry_delay_ms")]
    pub connect_retry_delay_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            connect_attempts: default_connect_attempts(),
            connect_retry_delay_ms: default_connect_retry_delay_ms(),
        }
    }
}

impl DatabaseConfig {
    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }
}

fn default_db_path() -> String {
    "~/.wikiselect/wikiselect.db".into()
}
fn default_connect_attempts() -> u32 {
    3
}
fn default_connect_retry_delay_ms() -> u64 {
    2_000
}

/// `[queue]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Minimum wall-clock gap between two jobs handed out by one worker.
    #[serde(default = "default_min_dequeue_interval_ms")]
    pub min_dequeue_interval_ms: u64,

    /// How long a single dequeue call waits for a job.
    #[serde(default = "default_dequeue_timeout_secs")]
    pub dequeue_timeout_secs: u64,

    /// How often the broker is polled while waiting.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            min_dequeue_interval_ms: default_min_dequeue_interval_ms(),
            dequeue_timeout_secs: default_dequeue_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl QueueConfig {
    pub fn min_dequeue_interval(&self) -> Duration {
        Duration::from_millis(self.min_dequeue_interval_ms)
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_secs(self.dequeue_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_min_dequeue_interval_ms() -> u64 {
    1_000
}
fn default_dequeue_timeout_secs() -> u64 {
    5
}
fn default_poll_interval_ms() -> u64 {
    250
}

/// `[artifacts]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactsConfig {
    /// Directory artifacts are written under.
    #[serde(default = "default_artifact_root")]
    pub root_dir: String,

    /// Public base URL that storage keys are appended to.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            root_dir: default_artifact_root(),
            public_base_url: default_public_base_url(),
        }
    }
}

fn default_artifact_root() -> String {
    "~/.wikiselect/artifacts".into()
}
fn default_public_base_url() -> String {
    "http://localhost:8000/artifacts/".into()
}

/// `[archive]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Base URL of the archive build service API.
    #[serde(default = "default_service_url")]
    pub service_url: String,

    /// Name of the env var holding the service token (never store the token itself).
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Largest selection (in articles) that may be submitted.
    #[serde(default = "default_max_articles")]
    pub max_articles: u64,

    /// HTTP timeout for service calls.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            service_url: default_service_url(),
            token_env: default_token_env(),
            max_articles: default_max_articles(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_service_url() -> String {
    "https://api.farm.openzim.org/v1".into()
}
fn default_token_env() -> String {
    "WIKISELECT_ARCHIVE_TOKEN".into()
}
fn default_max_articles() -> u64 {
    50_000
}
fn default_timeout_secs() -> u64 {
    30
}

/// Which mail backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailProvider {
    /// Write messages to the log only.
    #[default]
    Log,
    /// Mailgun-style HTTP messages API.
    Mailgun,
}

/// `[mail]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    #[serde(default)]
    pub provider: MailProvider,

    /// Messages endpoint, e.g. `https://api.mailgun.net/v3/<domain>/messages`.
    #[serde(default)]
    pub api_url: String,

    /// Name of the env var holding the mail API key.
    #[serde(default = "default_mail_key_env")]
    pub api_key_env: String,

    /// Sender address.
    #[serde(default = "default_from")]
    pub from: String,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            provider: MailProvider::default(),
            api_url: String::new(),
            api_key_env: default_mail_key_env(),
            from: default_from(),
        }
    }
}

fn default_mail_key_env() -> String {
    "WIKISELECT_MAIL_API_KEY".into()
}
fn default_from() -> String {
    "WikiSelect <noreply@localhost>".into()
}

/// `[models]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// SPARQL endpoint used by the `sparql` model.
    #[serde(default = "default_sparql_endpoint")]
    pub sparql_endpoint: String,

    /// HTTP timeout for article source requests.
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            sparql_endpoint: default_sparql_endpoint(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

fn default_sparql_endpoint() -> String {
    "https://query.wikidata.org/sparql".into()
}
fn default_http_timeout_secs() -> u64 {
    60
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.wikiselect/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| WikiSelectError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.wikiselect/wikiselect.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| WikiSelectError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| WikiSelectError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| WikiSelectError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| WikiSelectError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| WikiSelectError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| WikiSelectError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

/// Read a secret from the env var named by `var_name`.
pub fn read_secret(var_name: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(WikiSelectError::config(format!(
            "secret not found. Set the {var_name} environment variable."
        ))),
    }
}
