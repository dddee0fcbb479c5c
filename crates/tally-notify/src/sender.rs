//! Notification sender implementation.

use crate::channels::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tally_core::events::BalanceStatus;
use tally_core::ids::AccountId;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Channel not configured: {0}")]
    NotConfigured(String),
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),
}

/// Balance alert as delivered to a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub title: String,
    pub message: String,
    pub account_id: AccountId,
    pub status: BalanceStatus,
    pub available: i64,
    pub timestamp: DateTime<Utc>,
}

impl NotificationPayload {
    pub fn new(title: impl Into<String>, message: impl Into<String>, account_id: AccountId) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            account_id,
            status: BalanceStatus::Healthy,
            available: 0,
            timestamp: Utc::now(),
        }
    }

    /// Standard wording for a balance entering `status`.
    pub fn balance_alert(account_id: AccountId, status: BalanceStatus, available: i64) -> Self {
        let (title, message) = match status {
            BalanceStatus::Overdraft => (
                "Credit balance overdrawn",
                format!(
                    "The account is {} credits in overdraft. Active sessions will stop once the emergency buffer is used up.",
                    -available
                ),
            ),
            BalanceStatus::Critical => (
                "Credit balance critical",
                format!("Only {} credits left. Purchase credits to avoid interruptions.", available),
            ),
            BalanceStatus::Low => (
                "Credit balance low",
                format!("{} credits left. Consider topping up soon.", available),
            ),
            BalanceStatus::Healthy => ("Credit balance healthy", format!("{} credits available.", available)),
        };
        Self {
            title: title.to_string(),
            message,
            account_id,
            status,
            available,
            timestamp: Utc::now(),
        }
    }
}

/// Trait for notification senders.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, payload: &NotificationPayload) -> Result<(), NotifyError>;
}

/// Slack notification sender.
pub struct SlackSender {
    config: SlackConfig,
    client: reqwest::Client,
}

impl SlackSender {
    pub fn new(config: SlackConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn build_message(&self, payload: &NotificationPayload) -> serde_json::Value {
        let color = match payload.status {
            BalanceStatus::Healthy => "#36a64f",
            BalanceStatus::Low => "#f2c744",
            BalanceStatus::Critical => "#fd7e14",
            BalanceStatus::Overdraft => "#dc3545",
        };

        let fields = vec![
            serde_json::json!({"title": "Account", "value": payload.account_id.as_str(), "short": true}),
            serde_json::json!({"title": "Available", "value": payload.available.to_string(), "short": true}),
        ];

        serde_json::json!({
            "username": self.config.username,
            "icon_emoji": self.config.icon_emoji,
            "attachments": [{
                "color": color,
                "title": payload.title,
                "text": payload.message,
                "fields": fields,
                "ts": payload.timestamp.timestamp()
            }]
        })
    }
}

#[async_trait]
impl NotificationSender for SlackSender {
    async fn send(&self, payload: &NotificationPayload) -> Result<(), NotifyError> {
        if self.config.webhook_url.is_empty() {
            return Err(NotifyError::NotConfigured("slack webhook_url".to_string()));
        }
        debug!(account = %payload.account_id, "Sending Slack notification");

        let message = self.build_message(payload);
        let response = self
            .client
            .post(&self.config.webhook_url)
            .json(&message)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::DeliveryFailed(format!(
                "Slack returned {}: {}",
                status, body
            )));
        }

        info!(account = %payload.account_id, status = %payload.status, "Slack notification sent");
        Ok(())
    }
}

/// Generic webhook sender.
pub struct WebhookSender {
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookSender {
    pub fn new(config: WebhookConfig) -> Self {
        let timeout = config.timeout_seconds;
        Self {
            config,
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(timeout))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Hex HMAC-SHA256 of `body` under `secret`.
    pub fn signature(secret: &str, body: &[u8]) -> Result<String, NotifyError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .map_err(|e| NotifyError::NotConfigured(format!("signing secret: {}", e)))?;
        mac.update(body);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl NotificationSender for WebhookSender {
    async fn send(&self, payload: &NotificationPayload) -> Result<(), NotifyError> {
        if self.config.url.is_empty() {
            return Err(NotifyError::NotConfigured("webhook url".to_string()));
        }
        debug!(url = %self.config.url, "Sending webhook notification");

        let body = serde_json::to_vec(payload)?;
        let mut request = self
            .client
            .post(&self.config.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");

        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }
        if let Some(ref token) = self.config.bearer_token {
            request = request.bearer_auth(token);
        }
        if let Some(ref secret) = self.config.signing_secret {
            request = request.header("X-Tally-Signature", Self::signature(secret, &body)?);
        }

        let response = request.body(body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::DeliveryFailed(format!(
                "Webhook returned {}: {}",
                status, body
            )));
        }

        info!(account = %payload.account_id, status = %payload.status, "Webhook notification sent");
        Ok(())
    }
}

/// Writes alerts to the log.
pub struct LogSender;

#[async_trait]
impl NotificationSender for LogSender {
    async fn send(&self, payload: &NotificationPayload) -> Result<(), NotifyError> {
        warn!(
            account = %payload.account_id,
            status = %payload.status,
            available = payload.available,
            "{}",
            payload.title
        );
        Ok(())
    }
}

/// Create a sender for a channel configuration.
pub fn create_sender(config: &ChannelConfig) -> Box<dyn NotificationSender> {
    match config {
        ChannelConfig::Slack(c) => Box::new(SlackSender::new(c.clone())),
        ChannelConfig::Webhook(c) => Box::new(WebhookSender::new(c.clone())),
        ChannelConfig::Log => Box::new(LogSender),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_balance_alert_wording() {
        let payload = NotificationPayload::balance_alert(AccountId::new("user_1"), BalanceStatus::Overdraft, -12);
        assert_eq!(payload.title, "Credit balance overdrawn");
        assert!(payload.message.contains("12 credits in overdraft"));
    }

    #[test]
    fn test_slack_message_color() {
        let sender = SlackSender::new(SlackConfig::default());
        let payload = NotificationPayload::balance_alert(AccountId::new("user_1"), BalanceStatus::Critical, 5);
        let msg = sender.build_message(&payload);

        assert!(msg["attachments"][0]["color"].as_str().unwrap().contains("fd7e14"));
        assert_eq!(msg["attachments"][0]["fields"][1]["value"], "5");
    }

    #[tokio::test]
    async fn test_webhook_sends_signed_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/alerts"))
            .and(header("authorization", "Bearer tok"))
            .and(header_exists("x-tally-signature"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sender = WebhookSender::new(WebhookConfig {
            url: format!("{}/alerts", server.uri()),
            headers: HashMap::new(),
            bearer_token: Some("tok".into()),
            signing_secret: Some("shh".into()),
            timeout_seconds: 5,
        });
        let payload = NotificationPayload::balance_alert(AccountId::new("user_1"), BalanceStatus::Low, 80);
        sender.send(&payload).await.unwrap();
    }

    #[tokio::test]
    async fn test_webhook_failure_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("down"))
            .mount(&server)
            .await;

        let sender = WebhookSender::new(WebhookConfig {
            url: server.uri(),
            ..Default::default()
        });
        let payload = NotificationPayload::balance_alert(AccountId::new("user_1"), BalanceStatus::Low, 80);
        let err = sender.send(&payload).await.unwrap_err();
        assert!(matches!(err, NotifyError::DeliveryFailed(_)));
    }

    #[tokio::test]
    async fn test_unconfigured_slack_is_rejected() {
        let sender = SlackSender::new(SlackConfig::default());
        let payload = NotificationPayload::new("t", "m", AccountId::new("user_1"));
        assert!(matches!(
            sender.send(&payload).await,
            Err(NotifyError::NotConfigured(_))
        ));
    }
}
