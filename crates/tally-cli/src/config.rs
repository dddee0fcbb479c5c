//! Layered configuration: an optional YAML file, then `TALLY__`
//! environment variables (`TALLY__SERVER__PORT=9000`).

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use tally_admission::AdmissionConfig;
use tally_api::{MeteringConfig, ServerConfig, Settings};
use tally_billing::StripeConfig;
use tally_db::LedgerConfig;
use tally_metering::RateCard;
use tally_notify::AlertConfig;
use tally_reconcile::ReconcileConfig;
use tally_scheduler::SchedulerConfig;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TallyConfig {
    pub ledger: LedgerConfig,
    pub rates: RateCard,
    pub metering: MeteringConfig,
    pub admission: AdmissionConfig,
    pub reconcile: ReconcileConfig,
    pub alerts: AlertConfig,
    pub stripe: Option<StripeConfig>,
    pub scheduler: SchedulerConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl TallyConfig {
    /// Load from `path` (required) or `./tally.yaml` (optional), with
    /// environment overrides on top.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name("tally").required(false),
        };
        Self::from_builder(Config::builder().add_source(file))
    }

    fn from_builder(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self, ConfigError> {
        builder
            .add_source(
                Environment::with_prefix("TALLY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn settings(&self) -> Settings {
        Settings {
            ledger: self.ledger.clone(),
            rates: self.rates.clone(),
            metering: self.metering.clone(),
            admission: self.admission.clone(),
            reconcile: self.reconcile.clone(),
            alerts: self.alerts.clone(),
            stripe: self.stripe.clone(),
            scheduler: self.scheduler.clone(),
            server: self.server.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn from_yaml(yaml: &str) -> TallyConfig {
        TallyConfig::from_builder(Config::builder().add_source(File::from_str(yaml, FileFormat::Yaml))).unwrap()
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = from_yaml("{}");
        assert!(config.ledger.database.is_none());
        assert_eq!(config.admission.emergency_buffer, 50);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_yaml_sections_override_defaults() {
        let config = from_yaml(
            r#"
ledger:
  default_free_allocation: 30
  database:
    url: postgres://tally@localhost/tally
admission:
  emergency_buffer: 20
rates:
  call-minute: { credits: 7, per: 1 }
stripe:
  api_key: sk_test_123
  webhook_secret: whsec_abc
logging:
  format: json
"#,
        );
        assert_eq!(config.ledger.default_free_allocation, 30);
        assert_eq!(config.ledger.database.unwrap().max_connections, 20);
        assert_eq!(config.admission.emergency_buffer, 20);
        assert_eq!(config.admission.warning_threshold, 25);
        assert_eq!(config.rates.cost("call-minute", 2).unwrap(), 14);
        assert_eq!(config.stripe.unwrap().webhook_tolerance_secs, 300);
        assert_eq!(config.logging.format, LogFormat::Json);
    }
}
