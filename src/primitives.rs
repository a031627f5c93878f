// src/primitives.rs
//
// Branded integer types for the money path. Never convert these to `f64`;
// every arithmetic operation here is exact.

use crate::error::LedgerError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A non-negative quantity of micro-USD (1 USD = 1_000_000 micro-USD).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MicroUSD(u64);

impl MicroUSD {
    pub const ZERO: MicroUSD = MicroUSD(0);

    pub fn new(value: u64) -> Self {
        MicroUSD(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: MicroUSD) -> Result<MicroUSD, LedgerError> {
        self.0
            .checked_add(other.0)
            .map(MicroUSD)
            .ok_or_else(|| LedgerError::internal("MicroUSD overflow on add"))
    }

    /// Fails with `Invalid` rather than underflowing — a negative money-path
    /// result is always a caller bug or a corrupted lot, never a valid value.
    pub fn checked_sub(self, other: MicroUSD) -> Result<MicroUSD, LedgerError> {
        self.0
            .checked_sub(other.0)
            .map(MicroUSD)
            .ok_or_else(|| LedgerError::Invalid("underflow: subtrahend exceeds amount".into()))
    }

    pub fn min(self, other: MicroUSD) -> MicroUSD {
        MicroUSD(self.0.min(other.0))
    }

    /// floor(self * bps / 10_000), computed in u128 so `self * bps` cannot
    /// overflow before the divide.
    pub fn bps_share(self, bps: BasisPoints) -> MicroUSD {
        let product = (self.0 as u128) * (bps.get() as u128);
        MicroUSD((product / 10_000u128) as u64)
    }
}

impl fmt::Display for MicroUSD {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<i64> for MicroUSD {
    type Error = LedgerError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if value < 0 {
            return Err(LedgerError::Invalid("MicroUSD must be non-negative".into()));
        }
        Ok(MicroUSD(value as u64))
    }
}

impl From<MicroUSD> for i64 {
    fn from(value: MicroUSD) -> Self {
        value.0 as i64
    }
}

/// A signed micro-USD delta — used only for ledger entry `amount_micro`,
/// where the sign carries meaning (credit vs. debit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMicroUSD(i64);

impl SignedMicroUSD {
    pub fn new(value: i64) -> Self {
        SignedMicroUSD(value)
    }

    pub fn positive(amount: MicroUSD) -> Self {
        SignedMicroUSD(i64::from(amount))
    }

    pub fn negative(amount: MicroUSD) -> Self {
        SignedMicroUSD(-i64::from(amount))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for SignedMicroUSD {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A percentage in hundredths of a percent: `10_000 == 100%`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasisPoints(u32);

impl BasisPoints {
    pub const ZERO: BasisPoints = BasisPoints(0);
    pub const FULL: BasisPoints = BasisPoints(10_000);

    pub fn new(value: u32) -> Result<Self, LedgerError> {
        if value > 10_000 {
            return Err(LedgerError::Invalid(format!(
                "basis points out of range [0, 10000]: {value}"
            )));
        }
        Ok(BasisPoints(value))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

/// Asserts that a set of basis-point shares sums to exactly 100%.
pub fn assert_bps_sum(shares: &[BasisPoints]) -> Result<(), LedgerError> {
    let total: u32 = shares.iter().map(|b| b.get()).sum();
    if total != 10_000 {
        return Err(LedgerError::Invalid(format!(
            "basis point shares must sum to 10000, got {total}"
        )));
    }
    Ok(())
}

/// A non-empty account identifier. Distinct from a bare `String` so that an
/// empty id can never silently reach a query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(value: impl Into<String>) -> Result<Self, LedgerError> {
        let value = value.into();
        if value.is_empty() {
            return Err(LedgerError::Invalid("account id must not be empty".into()));
        }
        Ok(AccountId(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bps_share_floors() {
        let amount = MicroUSD::new(1_000_000);
        let bps = BasisPoints::new(3333).unwrap();
        // 1_000_000 * 3333 / 10_000 = 333_300
        assert_eq!(amount.bps_share(bps).get(), 333_300);
    }

    #[test]
    fn bps_share_large_amount_does_not_overflow() {
        let amount = MicroUSD::new(u64::MAX / 2);
        let bps = BasisPoints::FULL;
        assert_eq!(amount.bps_share(bps), amount);
    }

    #[test]
    fn checked_sub_underflow_is_invalid() {
        let a = MicroUSD::new(5);
        let b = MicroUSD::new(10);
        assert!(matches!(a.checked_sub(b), Err(LedgerError::Invalid(_))));
    }

    #[test]
    fn assert_bps_sum_rejects_non_100_pct() {
        let shares = vec![BasisPoints::new(5000).unwrap(), BasisPoints::new(4000).unwrap()];
        assert!(assert_bps_sum(&shares).is_err());
    }

    #[test]
    fn assert_bps_sum_accepts_exact_100_pct() {
        let shares = vec![BasisPoints::new(6000).unwrap(), BasisPoints::new(4000).unwrap()];
        assert!(assert_bps_sum(&shares).is_ok());
    }

    #[test]
    fn account_id_rejects_empty() {
        assert!(AccountId::new("").is_err());
        assert!(AccountId::new("person:u1").is_ok());
    }
}
