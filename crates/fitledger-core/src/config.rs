use std::path::Path;

use chrono::{Duration, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::activity::ActivityRewardPolicy;
use crate::amount::RateTable;
use crate::error::EconomyError;
use crate::mission::{default_templates, MissionTemplate};

/// Economy parameters shared by every user session.
///
/// Every field has a default, so a config file only needs to name the values
/// it overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EconomyConfig {
    pub conversion_rates: RateTable,
    pub activity_rewards: ActivityRewardPolicy,
    pub mission_templates: Vec<MissionTemplate>,
    /// Offset applied when judging time-of-day missions.
    pub utc_offset_seconds: i32,
    /// Activities older than this are rejected, and their ids are dropped
    /// from the per-user duplicate filter.
    pub activity_retention_days: u32,
}

impl Default for EconomyConfig {
    fn default() -> Self {
        Self {
            conversion_rates: RateTable::default(),
            activity_rewards: ActivityRewardPolicy::default(),
            mission_templates: default_templates(),
            utc_offset_seconds: 0,
            activity_retention_days: 30,
        }
    }
}

impl EconomyConfig {
    pub fn from_json(bytes: &[u8]) -> Result<Self, EconomyError> {
        let config: Self = serde_json::from_slice(bytes)
            .map_err(|e| EconomyError::Config(format!("economy config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, EconomyError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| EconomyError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_json(&bytes)
    }

    pub fn validate(&self) -> Result<(), EconomyError> {
        self.conversion_rates.validate()?;
        self.utc_offset()?;
        if self.activity_retention_days == 0 {
            return Err(EconomyError::Config(
                "activity_retention_days must be at least 1".to_string(),
            ));
        }

        let mut keys = std::collections::HashSet::new();
        for template in &self.mission_templates {
            template.validate()?;
            if !keys.insert(template.key.as_str()) {
                return Err(EconomyError::Config(format!(
                    "duplicate mission template '{}'",
                    template.key
                )));
            }
        }
        Ok(())
    }

    pub fn activity_retention(&self) -> Duration {
        Duration::days(i64::from(self.activity_retention_days))
    }

    pub fn utc_offset(&self) -> Result<FixedOffset, EconomyError> {
        FixedOffset::east_opt(self.utc_offset_seconds).ok_or_else(|| {
            EconomyError::Config(format!(
                "utc offset {}s is out of range",
                self.utc_offset_seconds
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::{TokenAmount, UnitId};

    #[test]
    fn default_config_is_valid() {
        let config = EconomyConfig::default();
        config.validate().unwrap();
        assert_eq!(config.mission_templates.len(), 5);
        assert!(config.conversion_rates.get(&UnitId::new("USD")).is_some());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = EconomyConfig::from_json(
            br#"{
                "utc_offset_seconds": -18000,
                "activity_rewards": {"tokens_per_minute": 25}
            }"#,
        )
        .unwrap();

        assert_eq!(config.utc_offset().unwrap().local_minus_utc(), -18_000);
        assert_eq!(
            config.activity_rewards.tokens_per_minute,
            TokenAmount::from_minor(25)
        );
        assert_eq!(config.activity_rewards.experience_per_minute, 2);
        assert_eq!(config.mission_templates.len(), 5);
    }

    #[test]
    fn rejects_bad_rates_and_offsets() {
        assert!(EconomyConfig::from_json(
            br#"{"conversion_rates": {"USD": {"numerator": 0, "denominator": 1}}}"#
        )
        .is_err());
        assert!(EconomyConfig::from_json(br#"{"utc_offset_seconds": 90000}"#).is_err());
        assert!(EconomyConfig::from_json(br#"{"activity_retention_days": 0}"#).is_err());
    }

    #[test]
    fn retention_window_defaults_to_thirty_days() {
        let config = EconomyConfig::default();
        assert_eq!(config.activity_retention(), Duration::days(30));

        let config = EconomyConfig::from_json(br#"{"activity_retention_days": 7}"#).unwrap();
        assert_eq!(config.activity_retention(), Duration::days(7));
    }

    #[test]
    fn rejects_duplicate_templates() {
        let mut config = EconomyConfig::default();
        let first = config.mission_templates[0].clone();
        config.mission_templates.push(first);
        assert!(config.validate().is_err());
    }
}
