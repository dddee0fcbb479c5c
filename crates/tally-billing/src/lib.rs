//! Credit purchases for Tally.
//!
//! Confirms payment-provider checkouts exactly once, verifies checkouts
//! against the Stripe API and handles Stripe webhooks.

pub mod confirmer;
pub mod stripe;
pub mod webhooks;

pub use confirmer::PurchaseConfirmer;
pub use stripe::{StripeClient, StripeConfig};
pub use webhooks::{
    CheckoutHandler, StripeEvent, StripeEventType, WebhookError, parse_event, process_webhook,
    sign_payload, verify_signature,
};
