//! Per-user economy state.
//!
//! A `UserSession` owns one user's ledger, mission batch, and purchases. The
//! catalog and economy config are injected and shared read-only between
//! sessions. Every mutating call is all-or-nothing: work happens on copies
//! that replace the live state only when the whole operation succeeds.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::activity::ActivityRecord;
use crate::amount::{TokenAmount, UnitId};
use crate::catalog::{OwnershipRecord, RewardCatalog};
use crate::config::EconomyConfig;
use crate::error::EconomyError;
use crate::ledger::{Conversion, Ledger, LedgerSnapshot, Transaction};
use crate::mission::{Mission, MissionBoard};

const MAX_USER_ID_LEN: usize = 64;

/// User ids double as storage keys, so they are restricted to
/// `[A-Za-z0-9_-]{1,64}`.
pub fn validate_user_id(user_id: &str) -> Result<(), EconomyError> {
    let valid = !user_id.is_empty()
        && user_id.len() <= MAX_USER_ID_LEN
        && user_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(EconomyError::InvalidUserId(user_id.to_string()))
    }
}

/// Serializable session state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub user_id: String,
    pub ledger: LedgerSnapshot,
    pub missions: Vec<Mission>,
    pub owned: Vec<OwnershipRecord>,
    /// Ingested activity ids with the activity timestamp, kept for the
    /// retention window.
    pub processed_activities: BTreeMap<Uuid, DateTime<Utc>>,
    pub saved_at: DateTime<Utc>,
}

/// What ingesting one activity did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityOutcome {
    pub activity_id: Uuid,
    pub duplicate: bool,
    pub missions_regenerated: bool,
    pub reward_transaction: Option<Transaction>,
    pub experience_awarded: u64,
    pub completed_missions: Vec<Mission>,
    pub balance: TokenAmount,
}

#[derive(Debug, Clone)]
pub struct UserSession {
    user_id: String,
    ledger: Ledger,
    missions: MissionBoard,
    owned: Vec<OwnershipRecord>,
    processed_activities: BTreeMap<Uuid, DateTime<Utc>>,
    catalog: Arc<RewardCatalog>,
    config: Arc<EconomyConfig>,
}

impl UserSession {
    pub fn new(
        user_id: impl Into<String>,
        catalog: Arc<RewardCatalog>,
        config: Arc<EconomyConfig>,
    ) -> Result<Self, EconomyError> {
        let user_id = user_id.into();
        validate_user_id(&user_id)?;
        let missions = MissionBoard::new(config.mission_templates.clone(), config.utc_offset()?);

        Ok(Self {
            user_id,
            ledger: Ledger::new(),
            missions,
            owned: Vec::new(),
            processed_activities: BTreeMap::new(),
            catalog,
            config,
        })
    }

    /// Rebuild a session from persisted state, verifying the ledger chain.
    pub fn restore(
        snapshot: SessionSnapshot,
        catalog: Arc<RewardCatalog>,
        config: Arc<EconomyConfig>,
    ) -> Result<Self, EconomyError> {
        validate_user_id(&snapshot.user_id)?;
        let ledger = Ledger::from_snapshot(snapshot.ledger)?;

        for record in &snapshot.owned {
            if ledger.find_transaction(record.transaction_id).is_none() {
                return Err(EconomyError::Ledger(format!(
                    "ownership of '{}' references unknown transaction {}",
                    record.reward_id, record.transaction_id
                )));
            }
        }

        let missions = MissionBoard::with_missions(
            config.mission_templates.clone(),
            config.utc_offset()?,
            snapshot.missions,
        );

        debug!(
            user_id = %snapshot.user_id,
            transactions = ledger.transactions().len(),
            "Restored user session"
        );

        Ok(Self {
            user_id: snapshot.user_id,
            ledger,
            missions,
            owned: snapshot.owned,
            processed_activities: snapshot.processed_activities,
            catalog,
            config,
        })
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            user_id: self.user_id.clone(),
            ledger: self.ledger.snapshot(),
            missions: self.missions.missions().to_vec(),
            owned: self.owned.clone(),
            processed_activities: self.processed_activities.clone(),
            saved_at: Utc::now(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn missions(&self) -> &[Mission] {
        self.missions.missions()
    }

    pub fn owned(&self) -> &[OwnershipRecord] {
        &self.owned
    }

    pub fn catalog(&self) -> &RewardCatalog {
        &self.catalog
    }

    pub fn refresh_missions(&mut self, now: DateTime<Utc>) -> bool {
        self.missions.regenerate_if_expired(now)
    }

    /// Credit the activity's own reward, then evaluate missions against it.
    ///
    /// Activity ids are remembered for the configured retention window;
    /// ingesting the same id again changes nothing and reports
    /// `duplicate: true`. Activities older than the window are rejected.
    pub fn ingest_activity(
        &mut self,
        activity: &ActivityRecord,
        now: DateTime<Utc>,
    ) -> Result<ActivityOutcome, EconomyError> {
        if self.processed_activities.contains_key(&activity.id) {
            debug!(activity_id = %activity.id, "Skipping already ingested activity");
            return Ok(ActivityOutcome {
                activity_id: activity.id,
                duplicate: true,
                missions_regenerated: false,
                reward_transaction: None,
                experience_awarded: 0,
                completed_missions: Vec::new(),
                balance: self.ledger.balance(),
            });
        }
        activity.validate()?;

        let cutoff = now - self.config.activity_retention();
        if activity.timestamp < cutoff {
            return Err(EconomyError::InvalidActivity(format!(
                "activity from {} is older than the {}-day retention window",
                activity.timestamp, self.config.activity_retention_days
            )));
        }

        let mut ledger = self.ledger.clone();
        let mut missions = self.missions.clone();
        let xp_before = ledger.experience_points();

        let missions_regenerated = missions.regenerate_if_expired(now);

        let reward = self.config.activity_rewards.reward_for(activity);
        let reward_transaction = if reward.tokens.is_zero() {
            None
        } else {
            Some(ledger.credit(
                reward.tokens,
                format!(
                    "Activity: {} {} min",
                    activity.kind, activity.duration_minutes
                ),
            )?)
        };
        ledger.award_experience(reward.experience);

        let completed_missions = missions.evaluate(activity, &mut ledger)?;

        let experience_awarded = ledger.experience_points() - xp_before;
        self.ledger = ledger;
        self.missions = missions;
        self.processed_activities.retain(|_, timestamp| *timestamp >= cutoff);
        self.processed_activities.insert(activity.id, activity.timestamp);

        info!(
            user_id = %self.user_id,
            activity_id = %activity.id,
            kind = %activity.kind,
            completed = completed_missions.len(),
            balance = %self.ledger.balance(),
            "Ingested activity"
        );

        Ok(ActivityOutcome {
            activity_id: activity.id,
            duplicate: false,
            missions_regenerated,
            reward_transaction,
            experience_awarded,
            completed_missions,
            balance: self.ledger.balance(),
        })
    }

    /// Feed a step total from the health-data source into step missions.
    pub fn record_steps(
        &mut self,
        step_count: u32,
        at: DateTime<Utc>,
    ) -> Result<Vec<Mission>, EconomyError> {
        let mut ledger = self.ledger.clone();
        let mut missions = self.missions.clone();

        missions.regenerate_if_expired(at);
        let completed = missions.record_steps(step_count, at, &mut ledger)?;

        self.ledger = ledger;
        self.missions = missions;
        Ok(completed)
    }

    pub fn credit(
        &mut self,
        transaction_id: Option<Uuid>,
        amount: TokenAmount,
        description: &str,
    ) -> Result<Transaction, EconomyError> {
        let id = transaction_id.unwrap_or_else(Uuid::new_v4);
        self.ledger.credit_with_id(id, amount, description)
    }

    pub fn debit(
        &mut self,
        transaction_id: Option<Uuid>,
        amount: TokenAmount,
        description: &str,
    ) -> Result<Transaction, EconomyError> {
        let id = transaction_id.unwrap_or_else(Uuid::new_v4);
        self.ledger.debit_with_id(id, amount, description)
    }

    pub fn convert(
        &mut self,
        transaction_id: Option<Uuid>,
        amount: TokenAmount,
        unit: &UnitId,
    ) -> Result<Conversion, EconomyError> {
        let id = transaction_id.unwrap_or_else(Uuid::new_v4);
        self.ledger
            .convert_with_id(id, amount, unit, &self.config.conversion_rates)
    }

    pub fn purchase(
        &mut self,
        transaction_id: Option<Uuid>,
        reward_id: &str,
    ) -> Result<OwnershipRecord, EconomyError> {
        let id = transaction_id.unwrap_or_else(Uuid::new_v4);
        self.catalog
            .purchase_with_id(id, reward_id, &mut self.ledger, &mut self.owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityKind;
    use chrono::TimeZone;

    fn session() -> UserSession {
        UserSession::new(
            "runner-1",
            Arc::new(RewardCatalog::builtin()),
            Arc::new(EconomyConfig::default()),
        )
        .unwrap()
    }

    fn morning() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 7, 0, 0).unwrap()
    }

    #[test]
    fn user_ids_are_restricted() {
        assert!(validate_user_id("runner_1-a").is_ok());
        assert!(validate_user_id("").is_err());
        assert!(validate_user_id("../etc").is_err());
        assert!(validate_user_id(&"x".repeat(65)).is_err());
    }

    #[test]
    fn morning_run_earns_activity_and_mission_rewards() {
        let mut session = session();
        let run = ActivityRecord::new(ActivityKind::Running, 35, morning()).with_calories(420);

        let outcome = session.ingest_activity(&run, morning()).unwrap();

        assert!(outcome.missions_regenerated);
        assert!(!outcome.duplicate);
        // 35 * 0.10 + 4 * 1.00 = 7.50
        assert_eq!(
            outcome.reward_transaction.as_ref().map(|tx| tx.amount_minor),
            Some(750)
        );

        let titles: Vec<&str> = outcome
            .completed_missions
            .iter()
            .map(|m| m.title.as_str())
            .collect();
        assert_eq!(titles, vec!["Morning Mover", "Cardio Half Hour", "Quick Burn"]);

        // 7.50 + 5 + 10 + 2
        assert_eq!(outcome.balance, TokenAmount::from_minor(2_450));
        assert_eq!(outcome.experience_awarded, 70 + 50 + 100 + 20);
        assert_eq!(session.ledger().experience_points(), 240);
    }

    #[test]
    fn reingesting_an_activity_is_a_no_op() {
        let mut session = session();
        let walk = ActivityRecord::new(ActivityKind::Walking, 20, morning());

        session.ingest_activity(&walk, morning()).unwrap();
        let balance = session.ledger().balance();
        let count = session.ledger().transactions().len();

        let again = session.ingest_activity(&walk, morning()).unwrap();
        assert!(again.duplicate);
        assert_eq!(session.ledger().balance(), balance);
        assert_eq!(session.ledger().transactions().len(), count);
    }

    #[test]
    fn invalid_activity_leaves_state_untouched() {
        let mut session = session();
        let bogus =
            ActivityRecord::new(ActivityKind::Cycling, 30, morning()).with_distance_km(f64::NAN);

        assert!(session.ingest_activity(&bogus, morning()).is_err());
        assert!(session.missions().is_empty());
        assert!(session.ledger().transactions().is_empty());
        assert!(session.snapshot().processed_activities.is_empty());
    }

    /// Session whose balance sits 2.00 tokens below `u64::MAX` minor units.
    fn nearly_full_session() -> UserSession {
        let mut session = session();
        session
            .credit(None, TokenAmount::from_minor(i64::MAX as u64), "seed")
            .unwrap();
        session
            .credit(None, TokenAmount::from_minor(i64::MAX as u64 - 199), "seed")
            .unwrap();
        assert_eq!(session.ledger().balance(), TokenAmount::from_minor(u64::MAX - 200));
        session
    }

    #[test]
    fn mission_credit_failure_rolls_back_activity_reward() {
        let mut session = nearly_full_session();
        let before = session.snapshot();
        // 1.50 activity reward fits; the mission rewards that follow overflow.
        let walk = ActivityRecord::new(ActivityKind::Walking, 15, morning());

        let err = session.ingest_activity(&walk, morning()).unwrap_err();
        assert!(matches!(err, EconomyError::InvalidAmount(_)));

        assert_eq!(session.ledger().balance(), before.ledger.balance);
        assert_eq!(session.ledger().transactions(), before.ledger.transactions.as_slice());
        assert_eq!(
            session.ledger().experience_points(),
            before.ledger.experience_points
        );
        assert_eq!(session.missions(), before.missions.as_slice());
        assert!(session.missions().iter().all(|mission| !mission.completed));
        assert!(session.snapshot().processed_activities.is_empty());

        // Nothing was remembered, so the same activity is not a duplicate.
        assert!(matches!(
            session.ingest_activity(&walk, morning()),
            Err(EconomyError::InvalidAmount(_))
        ));
    }

    #[test]
    fn step_credit_failure_leaves_missions_untouched() {
        let mut session = nearly_full_session();
        let count = session.ledger().transactions().len();

        assert!(session.record_steps(20_000, morning()).is_err());
        assert!(session.missions().is_empty());
        assert_eq!(session.ledger().transactions().len(), count);
    }

    #[test]
    fn activities_outside_retention_are_rejected_and_pruned() {
        let mut session = session();
        let early = ActivityRecord::new(ActivityKind::Yoga, 20, morning());
        session.ingest_activity(&early, morning()).unwrap();

        let later = morning() + chrono::Duration::days(31);
        let recent = ActivityRecord::new(ActivityKind::Walking, 20, later);
        session.ingest_activity(&recent, later).unwrap();

        let processed = session.snapshot().processed_activities;
        assert_eq!(processed.len(), 1);
        assert!(processed.contains_key(&recent.id));

        let count = session.ledger().transactions().len();
        assert!(matches!(
            session.ingest_activity(&early, later),
            Err(EconomyError::InvalidActivity(_))
        ));
        assert_eq!(session.ledger().transactions().len(), count);
    }

    #[test]
    fn steps_complete_step_mission() {
        let mut session = session();
        let completed = session.record_steps(12_000, morning()).unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].title, "Step Master");
        assert_eq!(session.ledger().balance(), TokenAmount::from_tokens(8));
    }

    #[test]
    fn purchase_and_convert_flow() {
        let mut session = session();
        session
            .credit(None, TokenAmount::from_tokens(100), "welcome bonus")
            .unwrap();

        let record = session.purchase(None, "premium-month").unwrap();
        assert_eq!(record.reward_id, "premium-month");
        assert_eq!(session.ledger().balance(), TokenAmount::from_tokens(50));

        let conversion = session
            .convert(None, TokenAmount::from_tokens(20), &UnitId::new("usd"))
            .unwrap();
        assert_eq!(conversion.converted_minor, 200);
        assert_eq!(session.ledger().balance(), TokenAmount::from_tokens(30));

        assert!(matches!(
            session.purchase(None, "studio-class"),
            Err(EconomyError::InsufficientBalance { .. })
        ));
        assert_eq!(session.owned().len(), 1);
    }

    #[test]
    fn snapshot_restores_equivalent_session() {
        let mut session = session();
        let yoga = ActivityRecord::new(ActivityKind::Yoga, 30, morning());
        session.ingest_activity(&yoga, morning()).unwrap();
        let _ = session.purchase(None, "plant-a-tree");

        let snapshot = session.snapshot();
        let json = serde_json::to_vec(&snapshot).unwrap();
        let decoded: SessionSnapshot = serde_json::from_slice(&json).unwrap();
        let restored = UserSession::restore(
            decoded,
            Arc::new(RewardCatalog::builtin()),
            Arc::new(EconomyConfig::default()),
        )
        .unwrap();

        assert_eq!(restored.ledger().balance(), session.ledger().balance());
        assert_eq!(restored.missions(), session.missions());
        assert_eq!(restored.owned(), session.owned());

        let mut restored = restored;
        assert!(restored.ingest_activity(&yoga, morning()).unwrap().duplicate);
    }

    #[test]
    fn restore_rejects_dangling_ownership() {
        let mut snapshot = session().snapshot();
        snapshot.owned.push(OwnershipRecord {
            reward_id: "plant-a-tree".to_string(),
            transaction_id: Uuid::new_v4(),
            purchased_at: morning(),
        });
        assert!(UserSession::restore(
            snapshot,
            Arc::new(RewardCatalog::builtin()),
            Arc::new(EconomyConfig::default()),
        )
        .is_err());
    }
}
