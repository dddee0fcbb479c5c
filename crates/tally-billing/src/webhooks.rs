//! Stripe webhook handling.

use crate::confirmer::PurchaseConfirmer;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tally_core::checkout::ConfirmationResult;
use thiserror::Error;
use tracing::{debug, info};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Signature timestamp outside tolerance")]
    StaleTimestamp,
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Handler error: {0}")]
    HandlerError(#[from] tally_core::Error),
}

/// Stripe webhook event types we handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StripeEventType {
    #[serde(rename = "checkout.session.completed")]
    CheckoutSessionCompleted,
    #[serde(rename = "checkout.session.async_payment_succeeded")]
    AsyncPaymentSucceeded,
    #[serde(rename = "checkout.session.async_payment_failed")]
    AsyncPaymentFailed,
    #[serde(rename = "checkout.session.expired")]
    CheckoutSessionExpired,
    #[serde(other)]
    Unknown,
}

/// Stripe webhook event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: StripeEventType,
    pub data: serde_json::Value,
    pub created: i64,
    #[serde(default)]
    pub livemode: bool,
}

/// Something that resolves checkouts named by webhook events.
#[async_trait::async_trait]
pub trait CheckoutHandler: Send + Sync {
    async fn on_checkout_event(&self, checkout_id: &str) -> tally_core::Result<ConfirmationResult>;
}

#[async_trait::async_trait]
impl CheckoutHandler for PurchaseConfirmer {
    async fn on_checkout_event(&self, checkout_id: &str) -> tally_core::Result<ConfirmationResult> {
        // The event body is never trusted for amounts; confirm re-verifies
        // with the Stripe API.
        self.confirm(checkout_id).await
    }
}

pub fn parse_event(payload: &[u8]) -> Result<StripeEvent, WebhookError> {
    serde_json::from_slice(payload).map_err(|e| WebhookError::ParseError(e.to_string()))
}

/// Process a Stripe webhook event. Returns `None` for ignored event types.
pub async fn process_webhook<H: CheckoutHandler + ?Sized>(
    handler: &H,
    event: StripeEvent,
) -> Result<Option<ConfirmationResult>, WebhookError> {
    info!(event_id = %event.id, event_type = ?event.event_type, "Processing Stripe webhook");

    match event.event_type {
        StripeEventType::CheckoutSessionCompleted
        | StripeEventType::AsyncPaymentSucceeded
        | StripeEventType::AsyncPaymentFailed
        | StripeEventType::CheckoutSessionExpired => {
            let checkout_id = checkout_id(&event.data)?;
            let result = handler.on_checkout_event(checkout_id).await?;
            Ok(Some(result))
        }
        StripeEventType::Unknown => {
            debug!(event_id = %event.id, "Ignoring unhandled event type");
            Ok(None)
        }
    }
}

fn checkout_id(data: &serde_json::Value) -> Result<&str, WebhookError> {
    data.get("object")
        .and_then(|obj| obj.get("id"))
        .and_then(|id| id.as_str())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| WebhookError::ParseError("Missing data.object.id".into()))
}

/// Verify a `Stripe-Signature` header (`t=<unix>,v1=<hex>[,v1=...]`).
///
/// The signed content is `"<t>.<payload>"` under HMAC-SHA256 with the
/// endpoint secret; any matching `v1` entry is accepted.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance: Duration,
    now: DateTime<Utc>,
) -> Result<(), WebhookError> {
    if secret.is_empty() {
        return Err(WebhookError::InvalidSignature);
    }

    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or(WebhookError::InvalidSignature)?;
    if signatures.is_empty() {
        return Err(WebhookError::InvalidSignature);
    }
    if now.timestamp().abs_diff(timestamp) > tolerance.num_seconds().unsigned_abs() {
        return Err(WebhookError::StaleTimestamp);
    }

    let mac = signed_mac(payload, secret, timestamp)?;
    let matched = signatures.iter().any(|sig| {
        hex::decode(sig)
            .map(|bytes| mac.clone().verify_slice(&bytes).is_ok())
            .unwrap_or(false)
    });
    if matched {
        Ok(())
    } else {
        Err(WebhookError::InvalidSignature)
    }
}

/// Build a `Stripe-Signature` header value for `payload`.
pub fn sign_payload(payload: &[u8], secret: &str, timestamp: i64) -> Result<String, WebhookError> {
    let mac = signed_mac(payload, secret, timestamp)?;
    Ok(format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    ))
}

fn signed_mac(payload: &[u8], secret: &str, timestamp: i64) -> Result<HmacSha256, WebhookError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| WebhookError::InvalidSignature)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac)
}
