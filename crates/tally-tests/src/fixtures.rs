//! Test fixtures for creating sample data.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tally_core::checkout::CheckoutVerification;
use tally_core::ids::AccountId;
use tally_core::ports::PaymentProvider;
use tally_core::usage::UsageEvent;
use tally_core::{Error, Result};

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

/// Factory for test accounts and usage.
pub struct UsageFixture;

impl UsageFixture {
    pub fn account(name: &str) -> AccountId {
        AccountId::new(format!("acct_{}", name))
    }

    /// `minutes` of call time. Five credits a minute at default rates.
    pub fn call_minutes(event_id: &str, account: &AccountId, minutes: u64) -> UsageEvent {
        UsageEvent::new(event_id, account.clone(), "call-minute", minutes)
    }

    /// One chat message: exactly one credit at default rates.
    pub fn one_credit(event_id: impl Into<String>, account: &AccountId) -> UsageEvent {
        UsageEvent::new(event_id, account.clone(), "chat-message", 1)
    }
}

/// A Stripe event body for `checkout_id`.
pub fn stripe_event(event_id: &str, event_type: &str, checkout_id: &str) -> Vec<u8> {
    serde_json::json!({
        "id": event_id,
        "type": event_type,
        "created": 1_700_000_000,
        "data": { "object": { "id": checkout_id, "object": "checkout.session" } }
    })
    .to_string()
    .into_bytes()
}

#[derive(Debug, Clone)]
enum Script {
    Verify(CheckoutVerification),
    Unreachable,
}

/// Payment provider answering from a script and counting calls.
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<HashMap<String, Script>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paid(&self, checkout_id: &str, account: &AccountId, credits: i64) {
        self.set(
            checkout_id,
            Script::Verify(CheckoutVerification::Paid {
                account_id: account.clone(),
                credits,
            }),
        );
    }

    pub fn pending(&self, checkout_id: &str) {
        self.set(checkout_id, Script::Verify(CheckoutVerification::Pending));
    }

    pub fn expired(&self, checkout_id: &str) {
        self.set(
            checkout_id,
            Script::Verify(CheckoutVerification::Invalid {
                reason: "checkout session expired".to_string(),
            }),
        );
    }

    pub fn unreachable(&self, checkout_id: &str) {
        self.set(checkout_id, Script::Unreachable);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn set(&self, checkout_id: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(checkout_id.to_string(), script);
    }
}

#[async_trait]
impl PaymentProvider for ScriptedProvider {
    async fn verify_checkout(&self, checkout_id: &str) -> Result<CheckoutVerification> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().unwrap().get(checkout_id).cloned();
        match script {
            Some(Script::Verify(verification)) => Ok(verification),
            Some(Script::Unreachable) => Err(Error::ProviderVerificationFailed(
                "connection reset".to_string(),
            )),
            None => Ok(CheckoutVerification::Invalid {
                reason: format!("no such checkout: {}", checkout_id),
            }),
        }
    }
}
