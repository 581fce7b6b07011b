use thiserror::Error;

use crate::amount::{TokenAmount, UnitId};

/// Token economy errors.
///
/// All variants are recoverable: an operation that returns an error leaves the
/// ledger, mission board, and ownership list exactly as they were.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EconomyError {
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("insufficient balance: requested {requested} tokens, available {available}")]
    InsufficientBalance {
        requested: TokenAmount,
        available: TokenAmount,
    },

    #[error("reward '{0}' not found")]
    RewardNotFound(String),

    #[error("no conversion rate configured for unit '{0}'")]
    UnknownUnit(UnitId),

    #[error("invalid activity: {0}")]
    InvalidActivity(String),

    #[error("invalid user id '{0}'")]
    InvalidUserId(String),

    #[error("transaction {id} was already recorded as a different operation")]
    TransactionConflict { id: uuid::Uuid },

    #[error("ledger integrity error: {0}")]
    Ledger(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EconomyError {
    /// True for failures a user can cause with valid input (as opposed to
    /// malformed requests or corrupted state).
    pub fn is_business_failure(&self) -> bool {
        matches!(
            self,
            EconomyError::InsufficientBalance { .. } | EconomyError::RewardNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_balance_display_uses_token_units() {
        let err = EconomyError::InsufficientBalance {
            requested: TokenAmount::from_tokens(50),
            available: TokenAmount::from_minor(3_025),
        };
        let s = err.to_string();
        assert!(s.contains("50.00"));
        assert!(s.contains("30.25"));
    }

    #[test]
    fn business_failure_classification() {
        assert!(EconomyError::RewardNotFound("x".into()).is_business_failure());
        assert!(!EconomyError::InvalidAmount("zero".into()).is_business_failure());
        assert!(!EconomyError::Ledger("broken".into()).is_business_failure());
    }
}
