//! FitLedger token economy core.
//!
//! Users earn fitness tokens and experience from recorded activities and
//! daily missions, convert tokens into external units, and spend them on
//! catalog rewards. Every balance change is an entry in a hash-chained,
//! append-only ledger.

#![deny(unsafe_code)]

pub mod activity;
pub mod amount;
pub mod catalog;
pub mod config;
pub mod error;
pub mod ledger;
pub mod mission;
pub mod session;
pub mod storage;

pub use activity::{ActivityKind, ActivityRecord, ActivityReward, ActivityRewardPolicy};
pub use amount::{
    AmountParseError, ConversionRate, RateTable, TokenAmount, UnitId, MINOR_PER_TOKEN,
};
pub use catalog::{OwnershipRecord, Reward, RewardCatalog, RewardCategory};
pub use config::EconomyConfig;
pub use error::EconomyError;
pub use ledger::{
    Conversion, ConversionLeg, Ledger, LedgerSnapshot, Transaction, TransactionKind, XP_PER_LEVEL,
};
pub use mission::{default_templates, Mission, MissionBoard, MissionMetric, MissionTemplate};
pub use session::{validate_user_id, ActivityOutcome, SessionSnapshot, UserSession};
pub use storage::{
    FileSessionStore, MemorySessionStore, PostgresSessionStore, SessionStore, StorageConfig,
    StorageError,
};
