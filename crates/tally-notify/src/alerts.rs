//! Balance classification and rate-limited alert dispatch.

use crate::channels::NotificationChannel;
use crate::sender::{NotificationPayload, NotificationSender, create_sender};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tally_core::Result;
use tally_core::events::{BalanceAlertPayload, BalanceStatus, LedgerEvent};
use tally_core::ids::AccountId;
use tally_core::ports::{AlertLog, EventBus};
use tracing::{debug, error, info, warn};

/// Alert thresholds and cool-down.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// At or below this balance the account is `low`.
    pub low_threshold: i64,
    /// At or below this balance the account is `critical`.
    pub critical_threshold: i64,
    pub cooldown_secs: i64,
    pub channels: Vec<NotificationChannel>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            low_threshold: 100,
            critical_threshold: 20,
            cooldown_secs: 3600,
            channels: Vec::new(),
        }
    }
}

impl AlertConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::seconds(self.cooldown_secs)
    }
}

/// Classify an available balance. Negative is always `overdraft`.
pub fn classify(config: &AlertConfig, available: i64) -> BalanceStatus {
    if available < 0 {
        BalanceStatus::Overdraft
    } else if available <= config.critical_threshold {
        BalanceStatus::Critical
    } else if available <= config.low_threshold {
        BalanceStatus::Low
    } else {
        BalanceStatus::Healthy
    }
}

struct Route {
    channel: NotificationChannel,
    sender: Box<dyn NotificationSender>,
}

/// Sends balance alerts, at most once per account and status per cool-down.
pub struct AlertDispatcher {
    config: AlertConfig,
    log: Arc<dyn AlertLog>,
    routes: Vec<Route>,
    events: Option<Arc<dyn EventBus>>,
}

impl AlertDispatcher {
    /// Dispatcher with a sender for every configured channel.
    pub fn new(config: AlertConfig, log: Arc<dyn AlertLog>) -> Self {
        let routes = config
            .channels
            .iter()
            .map(|channel| Route {
                sender: create_sender(&channel.config),
                channel: channel.clone(),
            })
            .collect();
        Self {
            config,
            log,
            routes,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Route alerts through `sender` under `channel`'s status filter.
    pub fn with_sender(mut self, channel: NotificationChannel, sender: Box<dyn NotificationSender>) -> Self {
        self.routes.push(Route { channel, sender });
        self
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    pub fn classify(&self, available: i64) -> BalanceStatus {
        classify(&self.config, available)
    }

    /// Classify `available` and notify if the status warrants it.
    /// Returns the status and whether a notification went out.
    pub async fn evaluate(&self, account: &AccountId, available: i64) -> Result<(BalanceStatus, bool)> {
        let status = self.classify(available);
        let notified = self.maybe_notify(account, status, available).await?;
        Ok((status, notified))
    }

    pub async fn maybe_notify(&self, account: &AccountId, status: BalanceStatus, available: i64) -> Result<bool> {
        self.maybe_notify_at(account, status, available, Utc::now()).await
    }

    /// Notify unless `(account, status)` was notified within the cool-down
    /// before `now`. Healthy balances never notify. Delivery failures are
    /// logged and do not release the claim.
    pub async fn maybe_notify_at(
        &self,
        account: &AccountId,
        status: BalanceStatus,
        available: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if status == BalanceStatus::Healthy {
            return Ok(false);
        }

        if !self.log.try_claim(account, status, now, self.config.cooldown()).await? {
            debug!(account = %account, status = %status, "Alert suppressed by cool-down");
            return Ok(false);
        }

        let payload = NotificationPayload::balance_alert(account.clone(), status, available);
        for route in self.routes.iter().filter(|r| r.channel.accepts(status)) {
            if let Err(e) = route.sender.send(&payload).await {
                error!(
                    account = %account,
                    status = %status,
                    channel = %route.channel.name,
                    error = %e,
                    "Alert delivery failed"
                );
            }
        }
        info!(account = %account, status = %status, available, "Balance alert raised");

        if let Some(events) = &self.events {
            let event = LedgerEvent::BalanceAlert(BalanceAlertPayload {
                account_id: account.clone(),
                status,
                available,
                notified_at: now,
            });
            if let Err(e) = events.publish(event).await {
                warn!(account = %account, error = %e, "Failed to publish balance alert");
            }
        }
        Ok(true)
    }
}
