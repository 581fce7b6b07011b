//! Fixed-point token amounts and conversion rates.
//!
//! Token quantities are held in minor units (hundredths of a token) so that
//! balances never drift the way floating point sums do. Conversions to a
//! secondary unit use an explicit rational rate and round toward zero.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::EconomyError;

/// Minor units per whole token.
pub const MINOR_PER_TOKEN: u64 = 100;

/// Non-negative token quantity in minor units.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TokenAmount(u64);

impl TokenAmount {
    pub const ZERO: TokenAmount = TokenAmount(0);

    pub const fn from_minor(minor: u64) -> Self {
        Self(minor)
    }

    pub const fn from_tokens(tokens: u64) -> Self {
        Self(tokens.saturating_mul(MINOR_PER_TOKEN))
    }

    pub const fn minor(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: TokenAmount) -> Option<TokenAmount> {
        self.0.checked_add(other.0).map(TokenAmount)
    }

    pub fn checked_sub(self, other: TokenAmount) -> Option<TokenAmount> {
        self.0.checked_sub(other.0).map(TokenAmount)
    }

    pub fn saturating_add(self, other: TokenAmount) -> TokenAmount {
        TokenAmount(self.0.saturating_add(other.0))
    }

    pub fn saturating_mul(self, factor: u64) -> TokenAmount {
        TokenAmount(self.0.saturating_mul(factor))
    }

    /// Signed representation used by transactions. Fails for amounts beyond
    /// `i64::MAX` minor units.
    pub fn to_signed(self) -> Result<i64, EconomyError> {
        i64::try_from(self.0).map_err(|_| {
            EconomyError::InvalidAmount(format!("{} exceeds the transaction range", self))
        })
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_minor(self.0))
    }
}

/// Render a minor-unit quantity with two decimal places.
pub fn format_minor(minor: u64) -> String {
    format!("{}.{:02}", minor / MINOR_PER_TOKEN, minor % MINOR_PER_TOKEN)
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AmountParseError {
    #[error("amount is empty")]
    Empty,
    #[error("amount '{0}' is not a non-negative decimal")]
    Malformed(String),
    #[error("amount '{0}' has more than two decimal places")]
    TooPrecise(String),
    #[error("amount '{0}' is too large")]
    Overflow(String),
}

impl FromStr for TokenAmount {
    type Err = AmountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(AmountParseError::Empty);
        }

        let (whole, fraction) = match trimmed.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (trimmed, ""),
        };

        let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if whole.is_empty() || !all_digits(whole) || !all_digits(fraction) {
            return Err(AmountParseError::Malformed(trimmed.to_string()));
        }
        if fraction.len() > 2 {
            return Err(AmountParseError::TooPrecise(trimmed.to_string()));
        }

        let overflow = || AmountParseError::Overflow(trimmed.to_string());
        let whole: u64 = whole.parse().map_err(|_| overflow())?;
        let fraction: u64 = match fraction.len() {
            0 => 0,
            1 => fraction.parse::<u64>().map_err(|_| overflow())? * 10,
            _ => fraction.parse().map_err(|_| overflow())?,
        };

        whole
            .checked_mul(MINOR_PER_TOKEN)
            .and_then(|minor| minor.checked_add(fraction))
            .map(TokenAmount)
            .ok_or_else(overflow)
    }
}

/// Conversion target identifier, e.g. `USD` or `FITC`. Always upper-case.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct UnitId(String);

impl UnitId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for UnitId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for UnitId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<UnitId> for String {
    fn from(value: UnitId) -> Self {
        value.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Positive rational rate: target minor units per token minor unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionRate {
    pub numerator: u64,
    pub denominator: u64,
}

impl ConversionRate {
    pub fn new(numerator: u64, denominator: u64) -> Result<Self, EconomyError> {
        let rate = Self {
            numerator,
            denominator,
        };
        rate.validate()?;
        Ok(rate)
    }

    pub fn validate(&self) -> Result<(), EconomyError> {
        if self.numerator == 0 || self.denominator == 0 {
            return Err(EconomyError::Config(format!(
                "conversion rate {}/{} must be positive",
                self.numerator, self.denominator
            )));
        }
        Ok(())
    }

    /// Converted quantity in target minor units, rounded toward zero.
    pub fn apply(&self, amount: TokenAmount) -> Result<u64, EconomyError> {
        self.validate()?;
        let product = u128::from(amount.minor()) * u128::from(self.numerator);
        u64::try_from(product / u128::from(self.denominator)).map_err(|_| {
            EconomyError::InvalidAmount(format!("conversion of {} tokens overflows", amount))
        })
    }
}

/// Static unit -> rate mapping.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RateTable {
    rates: BTreeMap<UnitId, ConversionRate>,
}

impl RateTable {
    pub fn new() -> Self {
        Self {
            rates: BTreeMap::new(),
        }
    }

    pub fn with_rate(mut self, unit: impl Into<UnitId>, rate: ConversionRate) -> Self {
        self.rates.insert(unit.into(), rate);
        self
    }

    pub fn get(&self, unit: &UnitId) -> Option<ConversionRate> {
        self.rates.get(unit).copied()
    }

    pub fn units(&self) -> impl Iterator<Item = &UnitId> {
        self.rates.keys()
    }

    pub fn validate(&self) -> Result<(), EconomyError> {
        for (unit, rate) in &self.rates {
            rate.validate()
                .map_err(|e| EconomyError::Config(format!("unit {unit}: {e}")))?;
        }
        Ok(())
    }
}

impl Default for RateTable {
    /// Ten tokens buy one US dollar; four tokens buy one FitCoin.
    fn default() -> Self {
        Self::new()
            .with_rate(
                "USD",
                ConversionRate {
                    numerator: 1,
                    denominator: 10,
                },
            )
            .with_rate(
                "FITC",
                ConversionRate {
                    numerator: 1,
                    denominator: 4,
                },
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays_two_decimal_amounts() {
        assert_eq!("12".parse::<TokenAmount>().unwrap().minor(), 1_200);
        assert_eq!("12.3".parse::<TokenAmount>().unwrap().minor(), 1_230);
        assert_eq!("0.05".parse::<TokenAmount>().unwrap().minor(), 5);
        assert_eq!(TokenAmount::from_minor(1_205).to_string(), "12.05");
        assert_eq!(TokenAmount::ZERO.to_string(), "0.00");
    }

    #[test]
    fn rejects_malformed_amounts() {
        assert_eq!("".parse::<TokenAmount>(), Err(AmountParseError::Empty));
        assert!(matches!(
            "-1".parse::<TokenAmount>(),
            Err(AmountParseError::Malformed(_))
        ));
        assert!(matches!(
            ".5".parse::<TokenAmount>(),
            Err(AmountParseError::Malformed(_))
        ));
        assert!(matches!(
            "1.234".parse::<TokenAmount>(),
            Err(AmountParseError::TooPrecise(_))
        ));
        assert!(matches!(
            "184467440737095517".parse::<TokenAmount>(),
            Err(AmountParseError::Overflow(_))
        ));
    }

    #[test]
    fn unit_ids_are_case_insensitive() {
        assert_eq!(UnitId::new("usd"), UnitId::new(" USD "));
        let parsed: UnitId = serde_json::from_str("\"fitc\"").unwrap();
        assert_eq!(parsed.as_str(), "FITC");
    }

    #[test]
    fn rate_rounds_toward_zero() {
        let rate = ConversionRate::new(1, 3).unwrap();
        assert_eq!(rate.apply(TokenAmount::from_minor(10)).unwrap(), 3);
        assert_eq!(rate.apply(TokenAmount::from_minor(2)).unwrap(), 0);
    }

    #[test]
    fn zero_rates_are_rejected() {
        assert!(ConversionRate::new(0, 1).is_err());
        assert!(ConversionRate::new(1, 0).is_err());
        let table = RateTable::new().with_rate(
            "BAD",
            ConversionRate {
                numerator: 1,
                denominator: 0,
            },
        );
        assert!(table.validate().is_err());
    }

    #[test]
    fn default_table_serializes_as_unit_map() {
        let json = serde_json::to_value(RateTable::default()).unwrap();
        assert_eq!(json["USD"]["denominator"], 10);
        assert_eq!(json["FITC"]["denominator"], 4);
    }
}
