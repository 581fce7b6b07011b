use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::amount::TokenAmount;
use crate::error::EconomyError;

/// Longest single activity accepted, in minutes.
pub const MAX_ACTIVITY_MINUTES: u32 = 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Running,
    Walking,
    Cycling,
    Swimming,
    Strength,
    Yoga,
    Meditation,
    Hiit,
    Other,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Walking => "walking",
            Self::Cycling => "cycling",
            Self::Swimming => "swimming",
            Self::Strength => "strength",
            Self::Yoga => "yoga",
            Self::Meditation => "meditation",
            Self::Hiit => "hiit",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A completed workout as reported by the tracking client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub kind: ActivityKind,
    pub duration_minutes: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub calories_burned: u32,
    #[serde(default)]
    pub distance_km: Option<f64>,
    #[serde(default)]
    pub step_count: Option<u32>,
}

impl ActivityRecord {
    pub fn new(kind: ActivityKind, duration_minutes: u32, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            duration_minutes,
            timestamp,
            calories_burned: 0,
            distance_km: None,
            step_count: None,
        }
    }

    pub fn with_calories(mut self, calories_burned: u32) -> Self {
        self.calories_burned = calories_burned;
        self
    }

    pub fn with_distance_km(mut self, distance_km: f64) -> Self {
        self.distance_km = Some(distance_km);
        self
    }

    pub fn validate(&self) -> Result<(), EconomyError> {
        if self.duration_minutes > MAX_ACTIVITY_MINUTES {
            return Err(EconomyError::InvalidActivity(format!(
                "duration {} min exceeds {} min",
                self.duration_minutes, MAX_ACTIVITY_MINUTES
            )));
        }
        if let Some(distance) = self.distance_km {
            if !distance.is_finite() || distance < 0.0 {
                return Err(EconomyError::InvalidActivity(format!(
                    "distance {distance} km is not a non-negative number"
                )));
            }
        }
        Ok(())
    }
}

/// Tokens and experience earned for an activity itself, independent of
/// missions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityReward {
    pub tokens: TokenAmount,
    pub experience: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityRewardPolicy {
    pub tokens_per_minute: TokenAmount,
    pub tokens_per_100_kcal: TokenAmount,
    pub experience_per_minute: u64,
}

impl Default for ActivityRewardPolicy {
    fn default() -> Self {
        Self {
            tokens_per_minute: TokenAmount::from_minor(10),
            tokens_per_100_kcal: TokenAmount::from_tokens(1),
            experience_per_minute: 2,
        }
    }
}

impl ActivityRewardPolicy {
    /// Calories count in whole hundreds; the remainder earns nothing.
    pub fn reward_for(&self, activity: &ActivityRecord) -> ActivityReward {
        let minutes = u64::from(activity.duration_minutes);
        let kcal_hundreds = u64::from(activity.calories_burned) / 100;

        let tokens = self
            .tokens_per_minute
            .saturating_mul(minutes)
            .saturating_add(self.tokens_per_100_kcal.saturating_mul(kcal_hundreds));

        ActivityReward {
            tokens,
            experience: self.experience_per_minute.saturating_mul(minutes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reward_combines_minutes_and_calories() {
        let policy = ActivityRewardPolicy::default();
        let activity =
            ActivityRecord::new(ActivityKind::Running, 30, Utc::now()).with_calories(350);

        let reward = policy.reward_for(&activity);
        // 30 min * 0.10 + 3 * 1.00
        assert_eq!(reward.tokens, TokenAmount::from_tokens(6));
        assert_eq!(reward.experience, 60);
    }

    #[test]
    fn idle_activity_earns_nothing() {
        let reward = ActivityRewardPolicy::default()
            .reward_for(&ActivityRecord::new(ActivityKind::Other, 0, Utc::now()));
        assert!(reward.tokens.is_zero());
        assert_eq!(reward.experience, 0);
    }

    #[test]
    fn validation_rejects_impossible_records() {
        let too_long =
            ActivityRecord::new(ActivityKind::Walking, MAX_ACTIVITY_MINUTES + 1, Utc::now());
        assert!(too_long.validate().is_err());

        let negative = ActivityRecord::new(ActivityKind::Cycling, 40, Utc::now())
            .with_distance_km(-3.0);
        assert!(negative.validate().is_err());

        let fine =
            ActivityRecord::new(ActivityKind::Cycling, 40, Utc::now()).with_distance_km(12.5);
        assert!(fine.validate().is_ok());
    }

    #[test]
    fn deserializes_with_optional_fields_missing() {
        let record: ActivityRecord = serde_json::from_value(serde_json::json!({
            "kind": "yoga",
            "duration_minutes": 20,
            "timestamp": "2026-03-01T07:30:00Z"
        }))
        .unwrap();
        assert_eq!(record.kind, ActivityKind::Yoga);
        assert_eq!(record.calories_burned, 0);
        assert!(record.step_count.is_none());
    }
}
