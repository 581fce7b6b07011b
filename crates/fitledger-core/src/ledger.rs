use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::amount::{format_minor, ConversionRate, RateTable, TokenAmount, UnitId};
use crate::error::EconomyError;

/// Experience points per level.
pub const XP_PER_LEVEL: u64 = 1_000;

/// Transaction kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Credited,
    Debited,
    Converted,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credited => "credited",
            Self::Debited => "debited",
            Self::Converted => "converted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "credited" => Some(Self::Credited),
            "debited" => Some(Self::Debited),
            "converted" => Some(Self::Converted),
            _ => None,
        }
    }
}

/// Secondary-unit side of a `converted` transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversionLeg {
    pub unit: UnitId,
    pub amount_minor: u64,
    pub rate: ConversionRate,
}

/// Hash-chained, immutable ledger transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub id: Uuid,
    pub index: u64,
    pub timestamp: DateTime<Utc>,
    /// Signed token delta in minor units.
    pub amount_minor: i64,
    pub kind: TransactionKind,
    pub description: String,
    pub conversion: Option<ConversionLeg>,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

impl Transaction {
    /// Absolute token quantity moved by this transaction.
    pub fn magnitude(&self) -> TokenAmount {
        TokenAmount::from_minor(self.amount_minor.unsigned_abs())
    }
}

/// Result of a token conversion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversion {
    pub transaction: Transaction,
    pub unit: UnitId,
    pub converted_minor: u64,
}

/// Persisted ledger state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub balance: TokenAmount,
    pub experience_points: u64,
    pub transactions: Vec<Transaction>,
}

/// Per-user token ledger.
///
/// The balance only moves through `credit`, `debit`, `convert`, and `replay`,
/// each of which appends exactly one transaction. A rejected operation leaves
/// balance and history untouched.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    balance: TokenAmount,
    experience_points: u64,
    transactions: Vec<Transaction>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a ledger from persisted state.
    ///
    /// Every transaction is replayed through the chain checks, and the
    /// resulting balance must match the persisted one.
    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Result<Self, EconomyError> {
        let mut ledger = Self::new();
        for transaction in snapshot.transactions {
            let id = transaction.id;
            if !ledger.replay(transaction)? {
                return Err(EconomyError::Ledger(format!(
                    "duplicate transaction {id} in persisted ledger"
                )));
            }
        }

        if ledger.balance != snapshot.balance {
            return Err(EconomyError::Ledger(format!(
                "persisted balance {} does not match replayed balance {}",
                snapshot.balance, ledger.balance
            )));
        }

        ledger.experience_points = snapshot.experience_points;
        Ok(ledger)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            balance: self.balance,
            experience_points: self.experience_points,
            transactions: self.transactions.clone(),
        }
    }

    pub fn balance(&self) -> TokenAmount {
        self.balance
    }

    pub fn experience_points(&self) -> u64 {
        self.experience_points
    }

    pub fn level(&self) -> u64 {
        self.experience_points / XP_PER_LEVEL + 1
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn find_transaction(&self, id: Uuid) -> Option<&Transaction> {
        self.transactions.iter().find(|tx| tx.id == id)
    }

    pub fn award_experience(&mut self, points: u64) {
        self.experience_points = self.experience_points.saturating_add(points);
    }

    pub fn credit(
        &mut self,
        amount: TokenAmount,
        description: impl Into<String>,
    ) -> Result<Transaction, EconomyError> {
        self.credit_with_id(Uuid::new_v4(), amount, description)
    }

    /// Credit under a caller-chosen id. Repeating a known id returns the
    /// original transaction without applying it again.
    pub fn credit_with_id(
        &mut self,
        id: Uuid,
        amount: TokenAmount,
        description: impl Into<String>,
    ) -> Result<Transaction, EconomyError> {
        if let Some(existing) = self.existing(id, TransactionKind::Credited)? {
            return Ok(existing);
        }
        ensure_positive(amount)?;

        let balance = self.balance.checked_add(amount).ok_or_else(|| {
            EconomyError::InvalidAmount(format!("credit of {amount} overflows the balance"))
        })?;
        let transaction = self.append(
            id,
            TransactionKind::Credited,
            amount.to_signed()?,
            description.into(),
            None,
        );
        self.balance = balance;

        debug!(
            transaction_id = %transaction.id,
            amount = %amount,
            balance = %self.balance,
            "Credited tokens"
        );
        Ok(transaction)
    }

    pub fn debit(
        &mut self,
        amount: TokenAmount,
        description: impl Into<String>,
    ) -> Result<Transaction, EconomyError> {
        self.debit_with_id(Uuid::new_v4(), amount, description)
    }

    pub fn debit_with_id(
        &mut self,
        id: Uuid,
        amount: TokenAmount,
        description: impl Into<String>,
    ) -> Result<Transaction, EconomyError> {
        if let Some(existing) = self.existing(id, TransactionKind::Debited)? {
            return Ok(existing);
        }
        ensure_positive(amount)?;
        let balance = self.remaining_after(amount)?;

        let transaction = self.append(
            id,
            TransactionKind::Debited,
            -amount.to_signed()?,
            description.into(),
            None,
        );
        self.balance = balance;

        debug!(
            transaction_id = %transaction.id,
            amount = %amount,
            balance = %self.balance,
            "Debited tokens"
        );
        Ok(transaction)
    }

    pub fn convert(
        &mut self,
        amount: TokenAmount,
        unit: &UnitId,
        rates: &RateTable,
    ) -> Result<Conversion, EconomyError> {
        self.convert_with_id(Uuid::new_v4(), amount, unit, rates)
    }

    /// Debit `amount` tokens and record their value in `unit` at the fixed
    /// rate from `rates`.
    pub fn convert_with_id(
        &mut self,
        id: Uuid,
        amount: TokenAmount,
        unit: &UnitId,
        rates: &RateTable,
    ) -> Result<Conversion, EconomyError> {
        if let Some(existing) = self.existing(id, TransactionKind::Converted)? {
            let leg = existing.conversion.clone().ok_or_else(|| {
                EconomyError::Ledger(format!("converted transaction {id} has no conversion leg"))
            })?;
            return Ok(Conversion {
                transaction: existing,
                unit: leg.unit,
                converted_minor: leg.amount_minor,
            });
        }
        ensure_positive(amount)?;

        let rate = rates
            .get(unit)
            .ok_or_else(|| EconomyError::UnknownUnit(unit.clone()))?;
        let converted_minor = rate.apply(amount)?;
        if converted_minor == 0 {
            return Err(EconomyError::InvalidAmount(format!(
                "{amount} tokens convert to zero {unit}"
            )));
        }
        let balance = self.remaining_after(amount)?;

        let description = format!(
            "Converted {} tokens to {} {}",
            amount,
            format_minor(converted_minor),
            unit
        );
        let transaction = self.append(
            id,
            TransactionKind::Converted,
            -amount.to_signed()?,
            description,
            Some(ConversionLeg {
                unit: unit.clone(),
                amount_minor: converted_minor,
                rate,
            }),
        );
        self.balance = balance;

        debug!(
            transaction_id = %transaction.id,
            amount = %amount,
            unit = %unit,
            converted_minor,
            "Converted tokens"
        );
        Ok(Conversion {
            transaction,
            unit: unit.clone(),
            converted_minor,
        })
    }

    /// Apply a transaction produced elsewhere (persistence, sync) exactly once.
    ///
    /// Returns `Ok(false)` when the id is already present. The transaction must
    /// extend the current chain and may not overdraw the balance.
    pub fn replay(&mut self, transaction: Transaction) -> Result<bool, EconomyError> {
        if self.find_transaction(transaction.id).is_some() {
            return Ok(false);
        }

        let expected_index = self.transactions.len() as u64;
        if transaction.index != expected_index {
            return Err(EconomyError::Ledger(format!(
                "transaction index gap: expected {}, got {}",
                expected_index, transaction.index
            )));
        }
        if transaction.previous_hash.as_deref() != self.last_hash() {
            return Err(EconomyError::Ledger(format!(
                "transaction {} does not extend the chain",
                transaction.id
            )));
        }
        if transaction.entry_hash != compute_entry_hash(&transaction) {
            return Err(EconomyError::Ledger(format!(
                "hash mismatch for transaction {}",
                transaction.id
            )));
        }

        let magnitude = transaction.magnitude();
        let balance = match (transaction.kind, transaction.amount_minor) {
            (TransactionKind::Credited, delta) if delta > 0 => self
                .balance
                .checked_add(magnitude)
                .ok_or_else(|| EconomyError::Ledger("replayed credit overflows".to_string()))?,
            (TransactionKind::Debited | TransactionKind::Converted, delta) if delta < 0 => self
                .balance
                .checked_sub(magnitude)
                .ok_or_else(|| {
                    EconomyError::Ledger(format!(
                        "replayed transaction {} overdraws the balance",
                        transaction.id
                    ))
                })?,
            (kind, delta) => {
                return Err(EconomyError::Ledger(format!(
                    "transaction {} has sign {} inconsistent with kind {}",
                    transaction.id,
                    delta.signum(),
                    kind.as_str()
                )))
            }
        };

        self.balance = balance;
        self.transactions.push(transaction);
        Ok(true)
    }

    pub fn verify_chain(&self) -> bool {
        let mut previous_hash: Option<&str> = None;
        for (index, transaction) in self.transactions.iter().enumerate() {
            if transaction.index != index as u64
                || transaction.previous_hash.as_deref() != previous_hash
                || transaction.entry_hash != compute_entry_hash(transaction)
            {
                return false;
            }
            previous_hash = Some(transaction.entry_hash.as_str());
        }
        true
    }

    fn existing(
        &self,
        id: Uuid,
        kind: TransactionKind,
    ) -> Result<Option<Transaction>, EconomyError> {
        match self.find_transaction(id) {
            Some(tx) if tx.kind == kind => Ok(Some(tx.clone())),
            Some(_) => Err(EconomyError::TransactionConflict { id }),
            None => Ok(None),
        }
    }

    fn remaining_after(&self, amount: TokenAmount) -> Result<TokenAmount, EconomyError> {
        self.balance.checked_sub(amount).ok_or_else(|| {
            warn!(
                requested = %amount,
                available = %self.balance,
                "Rejected debit: insufficient balance"
            );
            EconomyError::InsufficientBalance {
                requested: amount,
                available: self.balance,
            }
        })
    }

    fn last_hash(&self) -> Option<&str> {
        self.transactions.last().map(|tx| tx.entry_hash.as_str())
    }

    fn append(
        &mut self,
        id: Uuid,
        kind: TransactionKind,
        amount_minor: i64,
        description: String,
        conversion: Option<ConversionLeg>,
    ) -> Transaction {
        let mut transaction = Transaction {
            id,
            index: self.transactions.len() as u64,
            timestamp: Utc::now(),
            amount_minor,
            kind,
            description,
            conversion,
            previous_hash: self.last_hash().map(str::to_string),
            entry_hash: String::new(),
        };
        transaction.entry_hash = compute_entry_hash(&transaction);
        self.transactions.push(transaction.clone());
        transaction
    }
}

fn ensure_positive(amount: TokenAmount) -> Result<(), EconomyError> {
    if amount.is_zero() {
        return Err(EconomyError::InvalidAmount(
            "amount must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn compute_entry_hash(transaction: &Transaction) -> String {
    let material = serde_json::json!({
        "id": transaction.id,
        "index": transaction.index,
        "timestamp": transaction.timestamp,
        "amount_minor": transaction.amount_minor,
        "kind": transaction.kind,
        "description": transaction.description,
        "conversion": transaction.conversion,
        "previous_hash": transaction.previous_hash,
    });

    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}
