//! Daily missions and their evaluation against incoming activities.
//!
//! A `MissionBoard` holds one batch of missions instantiated from templates.
//! The whole batch shares an expiry one day after it was generated; once it
//! lapses the next `regenerate_if_expired` call replaces it.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, FixedOffset, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::activity::{ActivityKind, ActivityRecord};
use crate::amount::TokenAmount;
use crate::error::EconomyError;
use crate::ledger::Ledger;

/// Lifetime of a mission batch.
pub fn batch_lifetime() -> Duration {
    Duration::days(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionMetric {
    /// Single activity lasting at least `target_value` minutes.
    Duration,
    /// At least `target_value` steps reported through `record_steps`.
    StepCount,
    /// Activity logged before hour `target_value` (local time).
    TimeOfDay,
    /// Any activity of one of the applicable kinds.
    ActivityKind,
}

/// Immutable definition a mission is instantiated from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionTemplate {
    pub key: String,
    pub title: String,
    pub description: String,
    pub reward_tokens: TokenAmount,
    pub reward_experience: u64,
    pub metric: MissionMetric,
    pub target_value: u32,
    #[serde(default)]
    pub applicable_kinds: BTreeSet<ActivityKind>,
}

impl MissionTemplate {
    pub fn instantiate(&self, expiry: DateTime<Utc>) -> Mission {
        Mission {
            id: Uuid::new_v4(),
            template_key: self.key.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            reward_tokens: self.reward_tokens,
            reward_experience: self.reward_experience,
            metric: self.metric,
            target_value: self.target_value,
            applicable_kinds: self.applicable_kinds.clone(),
            completed: false,
            completed_at: None,
            expiry: Some(expiry),
        }
    }

    pub fn validate(&self) -> Result<(), EconomyError> {
        if self.key.trim().is_empty() {
            return Err(EconomyError::Config(
                "mission template key must not be empty".to_string(),
            ));
        }
        match self.metric {
            MissionMetric::TimeOfDay if self.target_value == 0 || self.target_value > 24 => {
                Err(EconomyError::Config(format!(
                    "mission '{}': hour target {} outside 1..=24",
                    self.key, self.target_value
                )))
            }
            MissionMetric::ActivityKind if self.applicable_kinds.is_empty() => {
                Err(EconomyError::Config(format!(
                    "mission '{}': activity_kind metric needs applicable kinds",
                    self.key
                )))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mission {
    pub id: Uuid,
    pub template_key: String,
    pub title: String,
    pub description: String,
    pub reward_tokens: TokenAmount,
    pub reward_experience: u64,
    pub metric: MissionMetric,
    pub target_value: u32,
    pub applicable_kinds: BTreeSet<ActivityKind>,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub expiry: Option<DateTime<Utc>>,
}

impl Mission {
    fn applies_to(&self, kind: ActivityKind) -> bool {
        self.applicable_kinds.is_empty() || self.applicable_kinds.contains(&kind)
    }

    /// Whether `activity` satisfies this mission. Step missions never match.
    pub fn is_satisfied_by(&self, activity: &ActivityRecord, offset: &FixedOffset) -> bool {
        match self.metric {
            MissionMetric::Duration => {
                activity.duration_minutes >= self.target_value && self.applies_to(activity.kind)
            }
            MissionMetric::TimeOfDay => {
                activity.timestamp.with_timezone(offset).hour() < self.target_value
            }
            MissionMetric::StepCount => false,
            MissionMetric::ActivityKind => self.applicable_kinds.contains(&activity.kind),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MissionBoard {
    templates: Vec<MissionTemplate>,
    missions: Vec<Mission>,
    offset: FixedOffset,
}

impl MissionBoard {
    /// Empty board; the first `regenerate_if_expired` call fills it.
    pub fn new(templates: Vec<MissionTemplate>, offset: FixedOffset) -> Self {
        Self {
            templates,
            missions: Vec::new(),
            offset,
        }
    }

    /// Board with a previously persisted batch.
    pub fn with_missions(
        templates: Vec<MissionTemplate>,
        offset: FixedOffset,
        missions: Vec<Mission>,
    ) -> Self {
        Self {
            templates,
            missions,
            offset,
        }
    }

    pub fn missions(&self) -> &[Mission] {
        &self.missions
    }

    /// Earliest expiry in the batch; `None` when the batch is empty or any
    /// mission lacks an expiry.
    pub fn batch_expiry(&self) -> Option<DateTime<Utc>> {
        if self.missions.is_empty() {
            return None;
        }
        self.missions
            .iter()
            .map(|mission| mission.expiry)
            .collect::<Option<Vec<_>>>()
            .and_then(|expiries| expiries.into_iter().min())
    }

    /// Replace the batch when it has expired at `now`. Returns whether a new
    /// batch was generated.
    pub fn regenerate_if_expired(&mut self, now: DateTime<Utc>) -> bool {
        if matches!(self.batch_expiry(), Some(expiry) if expiry > now) {
            return false;
        }

        let expiry = now + batch_lifetime();
        self.missions = self
            .templates
            .iter()
            .map(|template| template.instantiate(expiry))
            .collect();

        info!(
            missions = self.missions.len(),
            expiry = %expiry,
            "Generated mission batch"
        );
        true
    }

    /// Complete every open mission `activity` satisfies, crediting `ledger`.
    ///
    /// Returns the missions completed by this call, in batch order.
    pub fn evaluate(
        &mut self,
        activity: &ActivityRecord,
        ledger: &mut Ledger,
    ) -> Result<Vec<Mission>, EconomyError> {
        let satisfied: Vec<usize> = self
            .missions
            .iter()
            .enumerate()
            .filter(|(_, mission)| {
                !mission.completed && mission.is_satisfied_by(activity, &self.offset)
            })
            .map(|(index, _)| index)
            .collect();

        debug!(
            activity_id = %activity.id,
            kind = %activity.kind,
            satisfied = satisfied.len(),
            "Evaluated activity against missions"
        );

        self.complete_all(&satisfied, activity.timestamp, ledger)
    }

    /// Complete open step missions whose target is at most `step_count`.
    pub fn record_steps(
        &mut self,
        step_count: u32,
        at: DateTime<Utc>,
        ledger: &mut Ledger,
    ) -> Result<Vec<Mission>, EconomyError> {
        let satisfied: Vec<usize> = self
            .missions
            .iter()
            .enumerate()
            .filter(|(_, mission)| {
                !mission.completed
                    && mission.metric == MissionMetric::StepCount
                    && step_count >= mission.target_value
            })
            .map(|(index, _)| index)
            .collect();

        self.complete_all(&satisfied, at, ledger)
    }

    fn complete_all(
        &mut self,
        indices: &[usize],
        at: DateTime<Utc>,
        ledger: &mut Ledger,
    ) -> Result<Vec<Mission>, EconomyError> {
        let mut completed = Vec::with_capacity(indices.len());
        for &index in indices {
            let mission = &mut self.missions[index];
            if !mission.reward_tokens.is_zero() {
                ledger.credit(
                    mission.reward_tokens,
                    format!("Completed mission: {}", mission.title),
                )?;
            }
            ledger.award_experience(mission.reward_experience);
            mission.completed = true;
            mission.completed_at = Some(at);

            info!(
                mission = %mission.title,
                reward = %mission.reward_tokens,
                experience = mission.reward_experience,
                "Mission completed"
            );
            completed.push(mission.clone());
        }
        Ok(completed)
    }
}

/// Built-in daily missions.
pub fn default_templates() -> Vec<MissionTemplate> {
    use ActivityKind::*;

    vec![
        MissionTemplate {
            key: "morning-mover".to_string(),
            title: "Morning Mover".to_string(),
            description: "Log a workout before 9 AM".to_string(),
            reward_tokens: TokenAmount::from_tokens(5),
            reward_experience: 50,
            metric: MissionMetric::TimeOfDay,
            target_value: 9,
            applicable_kinds: BTreeSet::new(),
        },
        MissionTemplate {
            key: "cardio-half-hour".to_string(),
            title: "Cardio Half Hour".to_string(),
            description: "Run, ride, or swim for 30 minutes".to_string(),
            reward_tokens: TokenAmount::from_tokens(10),
            reward_experience: 100,
            metric: MissionMetric::Duration,
            target_value: 30,
            applicable_kinds: [Running, Cycling, Swimming].into_iter().collect(),
        },
        MissionTemplate {
            key: "step-master".to_string(),
            title: "Step Master".to_string(),
            description: "Walk 10,000 steps today".to_string(),
            reward_tokens: TokenAmount::from_tokens(8),
            reward_experience: 80,
            metric: MissionMetric::StepCount,
            target_value: 10_000,
            applicable_kinds: BTreeSet::new(),
        },
        MissionTemplate {
            key: "mindful-moment".to_string(),
            title: "Mindful Moment".to_string(),
            description: "Complete a yoga or meditation session".to_string(),
            reward_tokens: TokenAmount::from_tokens(3),
            reward_experience: 30,
            metric: MissionMetric::ActivityKind,
            target_value: 1,
            applicable_kinds: [Yoga, Meditation].into_iter().collect(),
        },
        MissionTemplate {
            key: "quick-burn".to_string(),
            title: "Quick Burn".to_string(),
            description: "Any workout of 15 minutes or more".to_string(),
            reward_tokens: TokenAmount::from_tokens(2),
            reward_experience: 20,
            metric: MissionMetric::Duration,
            target_value: 15,
            applicable_kinds: BTreeSet::new(),
        },
    ]
}
