//! Balance alerts and notification delivery for Tally.
//!
//! Classifies balances into health bands, sends at most one notification
//! per account and band per cool-down window, and carries ledger events
//! between components over an in-process bus.

pub mod alerts;
pub mod bus;
pub mod channels;
pub mod sender;
pub mod watcher;

pub use alerts::{AlertConfig, AlertDispatcher, classify};
pub use bus::LocalEventBus;
pub use channels::{ChannelConfig, NotificationChannel, SlackConfig, WebhookConfig};
pub use sender::{
    LogSender, NotificationPayload, NotificationSender, NotifyError, SlackSender, WebhookSender,
    create_sender,
};
pub use watcher::{AlertSweepSummary, AlertWatcher};
