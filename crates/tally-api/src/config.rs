//! Settings for the assembled service.

use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;
use tally_admission::AdmissionConfig;
use tally_billing::StripeConfig;
use tally_db::LedgerConfig;
use tally_metering::RateCard;
use tally_notify::AlertConfig;
use tally_reconcile::ReconcileConfig;
use tally_scheduler::SchedulerConfig;

/// Everything needed to assemble [`crate::AppState`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub ledger: LedgerConfig,
    pub rates: RateCard,
    pub metering: MeteringConfig,
    pub admission: AdmissionConfig,
    pub reconcile: ReconcileConfig,
    pub alerts: AlertConfig,
    pub stripe: Option<StripeConfig>,
    pub scheduler: SchedulerConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MeteringConfig {
    /// Usage events held in memory between flushes.
    pub batch_capacity: usize,
    /// When set, debits that would leave the balance below this are rejected.
    pub floor: Option<i64>,
    /// How long shutdown keeps flushing queued usage.
    pub drain_timeout_secs: u64,
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self {
            batch_capacity: 10_000,
            floor: None,
            drain_timeout_secs: 30,
        }
    }
}

impl MeteringConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Capacity of the in-process event bus.
    pub event_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            event_buffer: 1024,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }
}
