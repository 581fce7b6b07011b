use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::amount::TokenAmount;
use crate::error::EconomyError;
use crate::ledger::Ledger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardCategory {
    FitnessGear,
    Nutrition,
    Experience,
    Digital,
    Charity,
}

impl RewardCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FitnessGear => "fitness_gear",
            Self::Nutrition => "nutrition",
            Self::Experience => "experience",
            Self::Digital => "digital",
            Self::Charity => "charity",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "fitness_gear" => Some(Self::FitnessGear),
            "nutrition" => Some(Self::Nutrition),
            "experience" => Some(Self::Experience),
            "digital" => Some(Self::Digital),
            "charity" => Some(Self::Charity),
            _ => None,
        }
    }
}

impl fmt::Display for RewardCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reward {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub price: TokenAmount,
    pub category: RewardCategory,
}

/// Proof that a user bought a reward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipRecord {
    pub reward_id: String,
    pub transaction_id: Uuid,
    pub purchased_at: DateTime<Utc>,
}

/// Read-only list of purchasable rewards, fixed at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardCatalog {
    rewards: Vec<Reward>,
}

impl RewardCatalog {
    pub fn new(rewards: Vec<Reward>) -> Result<Self, EconomyError> {
        let mut seen = HashSet::new();
        for reward in &rewards {
            if reward.id.trim().is_empty() {
                return Err(EconomyError::Config("reward id must not be empty".to_string()));
            }
            if !seen.insert(reward.id.as_str()) {
                return Err(EconomyError::Config(format!(
                    "duplicate reward id '{}'",
                    reward.id
                )));
            }
        }
        Ok(Self { rewards })
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, EconomyError> {
        let rewards: Vec<Reward> = serde_json::from_slice(bytes)
            .map_err(|e| EconomyError::Config(format!("reward catalog: {e}")))?;
        Self::new(rewards)
    }

    pub fn get(&self, reward_id: &str) -> Option<&Reward> {
        self.rewards.iter().find(|reward| reward.id == reward_id)
    }

    pub fn list(&self) -> &[Reward] {
        &self.rewards
    }

    pub fn by_category(&self, category: RewardCategory) -> Vec<&Reward> {
        self.rewards
            .iter()
            .filter(|reward| reward.category == category)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rewards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rewards.is_empty()
    }

    pub fn purchase(
        &self,
        reward_id: &str,
        ledger: &mut Ledger,
        owned: &mut Vec<OwnershipRecord>,
    ) -> Result<OwnershipRecord, EconomyError> {
        self.purchase_with_id(Uuid::new_v4(), reward_id, ledger, owned)
    }

    /// Debit the reward price and record ownership.
    ///
    /// Retrying with the same `transaction_id` returns the original record.
    pub fn purchase_with_id(
        &self,
        transaction_id: Uuid,
        reward_id: &str,
        ledger: &mut Ledger,
        owned: &mut Vec<OwnershipRecord>,
    ) -> Result<OwnershipRecord, EconomyError> {
        let reward = self
            .get(reward_id)
            .ok_or_else(|| EconomyError::RewardNotFound(reward_id.to_string()))?;

        if let Some(record) = owned
            .iter()
            .find(|record| record.transaction_id == transaction_id)
        {
            if record.reward_id != reward.id {
                return Err(EconomyError::TransactionConflict { id: transaction_id });
            }
            return Ok(record.clone());
        }
        if ledger.find_transaction(transaction_id).is_some() {
            return Err(EconomyError::TransactionConflict { id: transaction_id });
        }

        let transaction = ledger.debit_with_id(
            transaction_id,
            reward.price,
            format!("Purchased {}", reward.title),
        )?;

        let record = OwnershipRecord {
            reward_id: reward.id.clone(),
            transaction_id: transaction.id,
            purchased_at: transaction.timestamp,
        };
        owned.push(record.clone());

        info!(
            reward = %reward.id,
            price = %reward.price,
            balance = %ledger.balance(),
            "Reward purchased"
        );
        Ok(record)
    }

    /// Built-in catalog.
    pub fn builtin() -> Self {
        let reward = |id: &str, title: &str, description: &str, tokens: u64, category| Reward {
            id: id.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            price: TokenAmount::from_tokens(tokens),
            category,
        };

        Self {
            rewards: vec![
                reward(
                    "water-bottle",
                    "Insulated Water Bottle",
                    "750 ml steel bottle",
                    150,
                    RewardCategory::FitnessGear,
                ),
                reward(
                    "resistance-bands",
                    "Resistance Band Set",
                    "Five bands, light to extra heavy",
                    220,
                    RewardCategory::FitnessGear,
                ),
                reward(
                    "protein-box",
                    "Protein Snack Box",
                    "Twelve assorted protein bars",
                    120,
                    RewardCategory::Nutrition,
                ),
                reward(
                    "meal-plan-week",
                    "One-Week Meal Plan",
                    "Personalised high-protein plan",
                    80,
                    RewardCategory::Nutrition,
                ),
                reward(
                    "studio-class",
                    "Studio Class Pass",
                    "One drop-in class at a partner studio",
                    300,
                    RewardCategory::Experience,
                ),
                reward(
                    "premium-month",
                    "Premium Month",
                    "Unlock advanced analytics for 30 days",
                    50,
                    RewardCategory::Digital,
                ),
                reward(
                    "plant-a-tree",
                    "Plant a Tree",
                    "Fund one tree with a reforestation partner",
                    40,
                    RewardCategory::Charity,
                ),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> RewardCatalog {
        RewardCatalog::new(vec![Reward {
            id: "band".to_string(),
            title: "Band".to_string(),
            description: String::new(),
            price: TokenAmount::from_tokens(50),
            category: RewardCategory::FitnessGear,
        }])
        .unwrap()
    }

    #[test]
    fn purchase_with_insufficient_balance_records_nothing() {
        let catalog = catalog();
        let mut ledger = Ledger::new();
        ledger.credit(TokenAmount::from_tokens(30), "seed").unwrap();
        let mut owned = Vec::new();

        let err = catalog.purchase("band", &mut ledger, &mut owned).unwrap_err();
        assert!(matches!(err, EconomyError::InsufficientBalance { .. }));
        assert!(owned.is_empty());
        assert_eq!(ledger.balance(), TokenAmount::from_tokens(30));
    }

    #[test]
    fn purchase_of_unknown_reward_fails_without_side_effects() {
        let catalog = catalog();
        let mut ledger = Ledger::new();
        ledger.credit(TokenAmount::from_tokens(100), "seed").unwrap();
        let mut owned = Vec::new();

        assert_eq!(
            catalog.purchase("yacht", &mut ledger, &mut owned),
            Err(EconomyError::RewardNotFound("yacht".to_string()))
        );
        assert_eq!(ledger.transactions().len(), 1);
    }

    #[test]
    fn successful_purchase_debits_and_records_ownership() {
        let catalog = catalog();
        let mut ledger = Ledger::new();
        ledger.credit(TokenAmount::from_tokens(80), "seed").unwrap();
        let mut owned = Vec::new();

        let record = catalog.purchase("band", &mut ledger, &mut owned).unwrap();
        assert_eq!(record.reward_id, "band");
        assert_eq!(owned, vec![record.clone()]);
        assert_eq!(ledger.balance(), TokenAmount::from_tokens(30));

        let debit = ledger.find_transaction(record.transaction_id).unwrap();
        assert_eq!(debit.description, "Purchased Band");
    }

    #[test]
    fn purchase_retry_with_same_id_is_idempotent() {
        let catalog = catalog();
        let mut ledger = Ledger::new();
        ledger.credit(TokenAmount::from_tokens(200), "seed").unwrap();
        let mut owned = Vec::new();
        let id = Uuid::new_v4();

        let first = catalog
            .purchase_with_id(id, "band", &mut ledger, &mut owned)
            .unwrap();
        let again = catalog
            .purchase_with_id(id, "band", &mut ledger, &mut owned)
            .unwrap();

        assert_eq!(first, again);
        assert_eq!(owned.len(), 1);
        assert_eq!(ledger.balance(), TokenAmount::from_tokens(150));
    }

    #[test]
    fn purchase_cannot_reuse_an_unrelated_transaction_id() {
        let catalog = catalog();
        let mut ledger = Ledger::new();
        ledger.credit(TokenAmount::from_tokens(10), "seed").unwrap();
        let mut owned = Vec::new();
        let id = Uuid::new_v4();
        ledger
            .debit_with_id(id, TokenAmount::from_minor(1), "tip")
            .unwrap();

        assert_eq!(
            catalog.purchase_with_id(id, "band", &mut ledger, &mut owned),
            Err(EconomyError::TransactionConflict { id })
        );
        assert!(owned.is_empty());
        assert_eq!(ledger.balance(), TokenAmount::from_minor(999));
        assert_eq!(ledger.transactions().len(), 2);
    }

    #[test]
    fn purchase_retry_for_a_different_reward_conflicts() {
        let mut rewards = catalog().list().to_vec();
        rewards.push(Reward {
            id: "mat".to_string(),
            title: "Mat".to_string(),
            description: String::new(),
            price: TokenAmount::from_tokens(20),
            category: RewardCategory::FitnessGear,
        });
        let catalog = RewardCatalog::new(rewards).unwrap();
        let mut ledger = Ledger::new();
        ledger.credit(TokenAmount::from_tokens(200), "seed").unwrap();
        let mut owned = Vec::new();
        let id = Uuid::new_v4();

        catalog
            .purchase_with_id(id, "mat", &mut ledger, &mut owned)
            .unwrap();
        assert_eq!(
            catalog.purchase_with_id(id, "band", &mut ledger, &mut owned),
            Err(EconomyError::TransactionConflict { id })
        );
        assert_eq!(owned.len(), 1);
        assert_eq!(ledger.balance(), TokenAmount::from_tokens(180));
    }

    #[test]
    fn catalog_rejects_duplicate_ids() {
        let mut rewards = catalog().list().to_vec();
        rewards.push(rewards[0].clone());
        assert!(RewardCatalog::new(rewards).is_err());
    }

    #[test]
    fn builtin_catalog_filters_by_category() {
        let catalog = RewardCatalog::builtin();
        assert!(RewardCatalog::new(catalog.list().to_vec()).is_ok());

        let nutrition = catalog.by_category(RewardCategory::Nutrition);
        assert_eq!(nutrition.len(), 2);
        assert!(nutrition
            .iter()
            .all(|reward| reward.category == RewardCategory::Nutrition));
    }

    #[test]
    fn loads_catalog_from_json() {
        let json = br#"[
            {"id": "socks", "title": "Run Socks", "price": 1250, "category": "fitness_gear"}
        ]"#;
        let catalog = RewardCatalog::from_json(json).unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get("socks").unwrap().price.to_string(), "12.50");
    }
}
