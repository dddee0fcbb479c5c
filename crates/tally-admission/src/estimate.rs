//! Session cost estimation.

use serde::{Deserialize, Serialize};
use tally_core::usage::services;
use tally_core::{Error, Result};
use tally_metering::RateCard;

/// Post-processing applied when a session ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostProcessing {
    Full,
    Simplified,
    #[default]
    None,
}

/// Fixed credit estimates for post-processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessingCosts {
    pub full: i64,
    pub simplified: i64,
}

impl Default for PostProcessingCosts {
    fn default() -> Self {
        Self {
            full: 10,
            simplified: 3,
        }
    }
}

impl PostProcessingCosts {
    pub fn cost(&self, mode: PostProcessing) -> i64 {
        match mode {
            PostProcessing::Full => self.full,
            PostProcessing::Simplified => self.simplified,
            PostProcessing::None => 0,
        }
    }
}

/// The metered services a session uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceProfile {
    /// Billed per minute; the session cannot run without them.
    pub mandatory: Vec<String>,
    /// Billed per minute; switched off when the session degrades.
    #[serde(default)]
    pub add_ons: Vec<String>,
    #[serde(default)]
    pub post_processing: PostProcessing,
}

impl ServiceProfile {
    /// A transcribed call. Transcription is part of the product, not an add-on.
    pub fn transcribed_call() -> Self {
        Self {
            mandatory: vec![
                services::CALL_MINUTE.to_string(),
                services::TRANSCRIPTION_MINUTE.to_string(),
            ],
            add_ons: Vec::new(),
            post_processing: PostProcessing::Full,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstimateLine {
    pub service: String,
    pub minutes: u64,
    pub credits: i64,
    pub optional: bool,
}

/// Projected cost of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub planned_minutes: u64,
    pub lines: Vec<EstimateLine>,
    pub post_processing: PostProcessing,
    pub post_processing_credits: i64,
    /// Everything in the profile.
    pub total: i64,
    /// Mandatory per-minute services only.
    pub mandatory_total: i64,
    /// Mandatory services with at most simplified post-processing.
    pub simplified_total: i64,
}

/// Longest session that can be planned: one week.
pub const MAX_PLANNED_MINUTES: u64 = 7 * 24 * 60;

fn checked_total(credits: impl IntoIterator<Item = i64>) -> Result<i64> {
    credits
        .into_iter()
        .try_fold(0i64, |acc, c| acc.checked_add(c))
        .ok_or_else(|| Error::InvalidInput("session estimate overflows".to_string()))
}

/// Prices service profiles with the rate card.
#[derive(Debug, Clone)]
pub struct Estimator {
    rates: RateCard,
    post_processing: PostProcessingCosts,
}

impl Estimator {
    pub fn new(rates: RateCard, post_processing: PostProcessingCosts) -> Self {
        Self {
            rates,
            post_processing,
        }
    }

    /// Estimate a session of `planned_minutes`. Fails with `UnknownService`
    /// if the profile names a service without a rate, and with `InvalidInput`
    /// past `MAX_PLANNED_MINUTES`.
    pub fn estimate(&self, profile: &ServiceProfile, planned_minutes: u64) -> Result<CostEstimate> {
        if planned_minutes > MAX_PLANNED_MINUTES {
            return Err(Error::InvalidInput(format!(
                "planned_minutes must be at most {}",
                MAX_PLANNED_MINUTES
            )));
        }
        let mut lines = Vec::with_capacity(profile.mandatory.len() + profile.add_ons.len());
        for (service, optional) in profile
            .mandatory
            .iter()
            .map(|s| (s, false))
            .chain(profile.add_ons.iter().map(|s| (s, true)))
        {
            lines.push(EstimateLine {
                service: service.clone(),
                minutes: planned_minutes,
                credits: self.rates.cost(service, planned_minutes)?,
                optional,
            });
        }

        let mandatory_total = checked_total(lines.iter().filter(|l| !l.optional).map(|l| l.credits))?;
        let add_on_total = checked_total(lines.iter().filter(|l| l.optional).map(|l| l.credits))?;
        let post_processing_credits = self.post_processing.cost(profile.post_processing);
        let simplified_post = post_processing_credits
            .min(self.post_processing.cost(PostProcessing::Simplified));

        Ok(CostEstimate {
            planned_minutes,
            total: checked_total([mandatory_total, add_on_total, post_processing_credits])?,
            simplified_total: checked_total([mandatory_total, simplified_post])?,
            lines,
            post_processing: profile.post_processing,
            post_processing_credits,
            mandatory_total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> Estimator {
        Estimator::new(RateCard::default(), PostProcessingCosts::default())
    }

    #[test]
    fn test_transcribed_call_estimate() {
        let estimate = estimator()
            .estimate(&ServiceProfile::transcribed_call(), 10)
            .unwrap();
        assert_eq!(estimate.mandatory_total, 70);
        assert_eq!(estimate.post_processing_credits, 10);
        assert_eq!(estimate.total, 80);
        assert_eq!(estimate.simplified_total, 73);
    }

    #[test]
    fn test_add_ons_excluded_from_simplified_total() {
        let profile = ServiceProfile {
            mandatory: vec![services::CALL_MINUTE.to_string()],
            add_ons: vec![services::TRANSCRIPTION_MINUTE.to_string()],
            post_processing: PostProcessing::None,
        };
        let estimate = estimator().estimate(&profile, 4).unwrap();
        assert_eq!(estimate.total, 28);
        assert_eq!(estimate.simplified_total, 20);
        assert!(estimate.lines[1].optional);
    }

    #[test]
    fn test_oversized_session_is_invalid_input() {
        let e = estimator();
        let profile = ServiceProfile::transcribed_call();
        assert!(e.estimate(&profile, MAX_PLANNED_MINUTES).is_ok());
        assert!(matches!(
            e.estimate(&profile, MAX_PLANNED_MINUTES + 1),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            e.estimate(&profile, 1_500_000_000_000_000_000),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_line_sum_overflow_is_invalid_input() {
        let rates = RateCard::empty()
            .with_rate("a-minute", tally_metering::Rate::new(i64::MAX as u64, 1))
            .with_rate("b-minute", tally_metering::Rate::new(1, 1));
        let profile = ServiceProfile {
            mandatory: vec!["a-minute".to_string(), "b-minute".to_string()],
            add_ons: Vec::new(),
            post_processing: PostProcessing::None,
        };
        let e = Estimator::new(rates, PostProcessingCosts::default());
        assert!(matches!(e.estimate(&profile, 1), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_unpriced_service_fails() {
        let profile = ServiceProfile {
            mandatory: vec!["hologram-minute".to_string()],
            add_ons: Vec::new(),
            post_processing: PostProcessing::Full,
        };
        assert!(matches!(
            estimator().estimate(&profile, 1),
            Err(Error::UnknownService(_))
        ));
    }
}
