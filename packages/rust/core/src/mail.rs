//! Outgoing notification mail.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};
use wikiselect_shared::{RecurrenceSchedule, Result, WikiSelectError};

/// A plain-text message to one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &MailMessage) -> Result<()>;
}

/// Writes messages to the log instead of delivering them.
#[derive(Debug, Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &MailMessage) -> Result<()> {
        info!(to = %message.to, subject = %message.subject, body = %message.body, "mail (not delivered)");
        Ok(())
    }
}

/// Delivers through a Mailgun-style `messages` endpoint.
#[derive(Debug, Clone)]
pub struct MailgunMailer {
    client: Client,
    api_url: String,
    api_key: String,
    from: String,
}

impl MailgunMailer {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        from: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WikiSelectError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_url: api_url.into(),
            api_key: api_key.into(),
            from: from.into(),
        })
    }
}

#[async_trait]
impl Mailer for MailgunMailer {
    async fn send(&self, message: &MailMessage) -> Result<()> {
        let response = self
            .client
            .post(&self.api_url)
            .basic_auth("api", Some(&self.api_key))
            .form(&[
                ("from", self.from.as_str()),
                ("to", message.to.as_str()),
                ("subject", message.subject.as_str()),
                ("text", message.body.as_str()),
            ])
            .send()
            .await
            .map_err(|e| WikiSelectError::upstream(format!("mail delivery failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(WikiSelectError::upstream(format!(
                "mail delivery failed: HTTP {status}"
            )));
        }
        debug!(to = %message.to, "mail delivered");
        Ok(())
    }
}

/// Ask a subscriber to confirm their address.
pub fn confirmation_message(
    schedule: &RecurrenceSchedule,
    email: &str,
    confirmation_token: &str,
    unsubscribe_token: &str,
    web_base_url: &str,
) -> MailMessage {
    let base = web_base_url.trim_end_matches('/');
    MailMessage {
        to: email.to_string(),
        subject: format!("Confirm notifications for \"{}\"", schedule.title),
        body: format!(
            "You asked to be notified when a new archive of \"{title}\" is ready.\n\n\
             Confirm your address:\n{base}/schedules/confirm/{confirmation_token}\n\n\
             If this wasn't you, unsubscribe here:\n{base}/schedules/unsubscribe/{unsubscribe_token}\n",
            title = schedule.title,
        ),
    }
}

/// Tell a confirmed subscriber that a new archive is available.
pub fn ready_message(
    schedule: &RecurrenceSchedule,
    email: &str,
    unsubscribe_token: Option<&str>,
    web_base_url: &str,
) -> MailMessage {
    let base = web_base_url.trim_end_matches('/');
    let mut body = format!(
        "A new archive of \"{}\" has been built and is ready to download.\n",
        schedule.title
    );
    if let Some(token) = unsubscribe_token {
        body.push_str(&format!(
            "\nStop these notifications:\n{base}/schedules/unsubscribe/{token}\n"
        ));
    }
    MailMessage {
        to: email.to_string(),
        subject: format!("Your archive \"{}\" is ready", schedule.title),
        body,
    }
}
