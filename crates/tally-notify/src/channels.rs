//! Notification channel configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tally_core::events::BalanceStatus;

/// A configured destination for balance alerts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationChannel {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub config: ChannelConfig,
    /// Bands this channel receives. Empty means all of them.
    #[serde(default)]
    pub statuses: Vec<BalanceStatus>,
}

fn default_enabled() -> bool {
    true
}

impl NotificationChannel {
    pub fn accepts(&self, status: BalanceStatus) -> bool {
        self.enabled && (self.statuses.is_empty() || self.statuses.contains(&status))
    }
}

/// Channel-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelConfig {
    Slack(SlackConfig),
    Webhook(WebhookConfig),
    /// Write alerts to the log only.
    Log,
}

/// Slack webhook configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlackConfig {
    pub webhook_url: String,
    pub username: String,
    pub icon_emoji: String,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            username: "Tally".to_string(),
            icon_emoji: ":money_with_wings:".to_string(),
        }
    }
}

/// Generic webhook configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub bearer_token: Option<String>,
    /// When set, the body is signed with HMAC-SHA256 into `X-Tally-Signature`.
    pub signing_secret: Option<String>,
    pub timeout_seconds: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            headers: HashMap::new(),
            bearer_token: None,
            signing_secret: None,
            timeout_seconds: 10,
        }
    }
}
