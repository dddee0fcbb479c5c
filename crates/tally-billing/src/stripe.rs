//! Stripe checkout verification.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tally_core::checkout::{CheckoutVerification, validate_checkout_id};
use tally_core::ids::AccountId;
use tally_core::ports::PaymentProvider;
use tally_core::{Error, Result};
use tracing::{debug, error, info};

/// Stripe client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeConfig {
    pub api_key: String,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    /// API base URL.
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum age of a signed webhook.
    #[serde(default = "default_webhook_tolerance_secs")]
    pub webhook_tolerance_secs: i64,
}

fn default_api_url() -> String {
    "https://api.stripe.com".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_webhook_tolerance_secs() -> i64 {
    300
}

impl StripeConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            webhook_secret: None,
            api_url: default_api_url(),
            timeout_secs: default_timeout_secs(),
            webhook_tolerance_secs: default_webhook_tolerance_secs(),
        }
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }
}

/// The fields of a Checkout Session we read.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    /// `open`, `complete` or `expired`.
    pub status: Option<String>,
    /// `paid`, `unpaid` or `no_payment_required`.
    pub payment_status: Option<String>,
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CheckoutSession {
    /// Map the session onto a verification outcome.
    ///
    /// The purchased credit amount travels in `metadata.credits`; the account
    /// in `client_reference_id`, falling back to `metadata.account_id`.
    pub fn verification(&self) -> CheckoutVerification {
        let status = self.status.as_deref().unwrap_or("open");
        let payment = self.payment_status.as_deref().unwrap_or("unpaid");

        match (status, payment) {
            ("complete", "paid" | "no_payment_required") => {
                let Some(account) = self
                    .client_reference_id
                    .as_deref()
                    .or_else(|| self.metadata.get("account_id").map(String::as_str))
                    .filter(|s| !s.is_empty())
                else {
                    return CheckoutVerification::Invalid {
                        reason: "checkout has no account reference".to_string(),
                    };
                };
                match self.metadata.get("credits").map(|c| c.parse::<i64>()) {
                    Some(Ok(credits)) if credits > 0 => CheckoutVerification::Paid {
                        account_id: AccountId::new(account),
                        credits,
                    },
                    _ => CheckoutVerification::Invalid {
                        reason: "checkout has no credit amount".to_string(),
                    },
                }
            }
            ("expired", _) => CheckoutVerification::Invalid {
                reason: "checkout session expired".to_string(),
            },
            _ => CheckoutVerification::Pending,
        }
    }
}

/// Stripe API client.
pub struct StripeClient {
    config: StripeConfig,
    client: reqwest::Client,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// Fetch a checkout session. `None` when Stripe does not know the ID.
    pub async fn retrieve_checkout_session(&self, checkout_id: &str) -> Result<Option<CheckoutSession>> {
        validate_checkout_id(checkout_id)?;
        let url = format!(
            "{}/v1/checkout/sessions/{}",
            self.config.api_url.trim_end_matches('/'),
            checkout_id
        );

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| Error::ProviderVerificationFailed(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            info!(checkout_id, "Stripe does not know this checkout session");
            return Ok(None);
        }
        // Anything else, including auth failures on our side, must not
        // resolve a customer's checkout permanently.
        if !status.is_success() {
            error!(checkout_id, status = %status, "Stripe checkout lookup failed");
            return Err(Error::ProviderVerificationFailed(format!(
                "Stripe returned {}",
                status
            )));
        }

        let session = response
            .json::<CheckoutSession>()
            .await
            .map_err(|e| Error::ProviderVerificationFailed(e.to_string()))?;
        Ok(Some(session))
    }
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn verify_checkout(&self, checkout_id: &str) -> Result<CheckoutVerification> {
        let Some(session) = self.retrieve_checkout_session(checkout_id).await? else {
            return Ok(CheckoutVerification::Invalid {
                reason: "checkout session not found".to_string(),
            });
        };
        let verification = session.verification();
        debug!(checkout_id, outcome = ?verification, "Checkout verified");
        Ok(verification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> StripeClient {
        StripeClient::new(StripeConfig::new("sk_test_123").with_api_url(server.uri())).unwrap()
    }

    #[tokio::test]
    async fn test_paid_session_verifies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/checkout/sessions/cs_paid"))
            .and(header("authorization", "Bearer sk_test_123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "cs_paid",
                "status": "complete",
                "payment_status": "paid",
                "client_reference_id": "user_1",
                "metadata": { "credits": "500" }
            })))
            .mount(&server)
            .await;

        let verification = client(&server).verify_checkout("cs_paid").await.unwrap();
        assert_eq!(
            verification,
            CheckoutVerification::Paid {
                account_id: AccountId::new("user_1"),
                credits: 500
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_session_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let verification = client(&server).verify_checkout("cs_missing").await.unwrap();
        assert!(matches!(verification, CheckoutVerification::Invalid { .. }));
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client(&server).verify_checkout("cs_1").await.unwrap_err();
        assert!(matches!(err, Error::ProviderVerificationFailed(_)));
    }

    #[tokio::test]
    async fn test_malformed_checkout_id_never_reaches_stripe() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = client(&server).verify_checkout("cs_1/../../charges").await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_session_states() {
        let mut session = CheckoutSession {
            id: "cs_1".into(),
            status: Some("open".into()),
            payment_status: Some("unpaid".into()),
            client_reference_id: None,
            metadata: HashMap::from([
                ("account_id".to_string(), "user_2".to_string()),
                ("credits".to_string(), "100".to_string()),
            ]),
        };
        assert_eq!(session.verification(), CheckoutVerification::Pending);

        session.status = Some("complete".into());
        session.payment_status = Some("paid".into());
        assert_eq!(
            session.verification(),
            CheckoutVerification::Paid {
                account_id: AccountId::new("user_2"),
                credits: 100
            }
        );

        session.status = Some("expired".into());
        assert!(matches!(session.verification(), CheckoutVerification::Invalid { .. }));
    }
}
