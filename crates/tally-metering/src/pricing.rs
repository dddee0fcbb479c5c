//! Integer pricing for metered services.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use tally_core::usage::services;
use tally_core::{Error, Result};

/// `credits` per `per` units, rounded up to whole credits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rate {
    pub credits: u64,
    #[serde(default = "default_per")]
    pub per: u64,
}

fn default_per() -> u64 {
    1
}

impl Rate {
    pub const fn new(credits: u64, per: u64) -> Self {
        Self { credits, per }
    }

    /// Cost of `quantity` units: ceil(quantity * credits / per).
    pub fn cost(&self, quantity: u64) -> Result<i64> {
        if self.per == 0 || self.credits == 0 {
            return Err(Error::InvalidInput(format!(
                "rate {}/{} is not billable",
                self.credits, self.per
            )));
        }
        let total = (quantity as u128 * self.credits as u128).div_ceil(self.per as u128);
        i64::try_from(total)
            .map_err(|_| Error::InvalidInput(format!("cost of {} units overflows", quantity)))
    }
}

/// Prices per service tag.
///
/// Deserializing a map overrides or extends the default card rather than
/// replacing it, so a config only needs to list what differs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RateCard {
    rates: HashMap<String, Rate>,
}

impl Default for RateCard {
    fn default() -> Self {
        Self::empty()
            .with_rate(services::CALL_MINUTE, Rate::new(5, 1))
            .with_rate(services::TRANSCRIPTION_MINUTE, Rate::new(2, 1))
            .with_rate(services::MODEL_TOKENS, Rate::new(1, 1000))
            .with_rate(services::CHAT_MESSAGE, Rate::new(1, 1))
    }
}

impl<'de> Deserialize<'de> for RateCard {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let overrides = HashMap::<String, Rate>::deserialize(deserializer)?;
        if let Some((service, _)) = overrides.iter().find(|(_, r)| r.credits == 0 || r.per == 0) {
            return Err(serde::de::Error::custom(format!(
                "rate for {} must have non-zero credits and per",
                service
            )));
        }
        let mut card = RateCard::default();
        card.rates.extend(overrides);
        Ok(card)
    }
}

impl RateCard {
    pub fn empty() -> Self {
        Self {
            rates: HashMap::new(),
        }
    }

    pub fn with_rate(mut self, service: impl Into<String>, rate: Rate) -> Self {
        self.rates.insert(service.into(), rate);
        self
    }

    pub fn rate(&self, service: &str) -> Option<Rate> {
        self.rates.get(service).copied()
    }

    /// Whole-credit cost of `quantity` units of `service`.
    pub fn cost(&self, service: &str, quantity: u64) -> Result<i64> {
        self.rate(service)
            .ok_or_else(|| Error::UnknownService(service.to_string()))?
            .cost(quantity)
    }

    /// Known service tags, sorted.
    pub fn services(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.rates.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }
}
