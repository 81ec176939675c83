//! Provider/platform revenue split.
//!
//! The provider receives `floor(total * provider_share)` and the platform
//! receives the rest. Flooring the provider side means any sub-unit
//! remainder (strictly less than one minor unit) goes to the platform, so
//! the two shares always add back to the total exactly.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use crate::LedgerError;

/// Default provider share: 80% to the provider, 20% to the platform.
pub const DEFAULT_PROVIDER_SHARE: Decimal = Decimal::from_parts(80, 0, 0, false, 2);

/// A validated provider share in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct RevenueSplit {
    provider_share: Decimal,
}

impl RevenueSplit {
    /// Create a split giving `provider_share` of every settlement to the provider.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidShare`] unless `0 <= provider_share <= 1`.
    pub fn new(provider_share: Decimal) -> Result<Self, LedgerError> {
        if provider_share.is_sign_negative() || provider_share > Decimal::ONE {
            return Err(LedgerError::InvalidShare { provider_share });
        }
        Ok(Self { provider_share })
    }

    /// The provider's fraction.
    pub const fn provider_share(&self) -> Decimal {
        self.provider_share
    }

    /// Split `total` minor units between provider and platform.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NegativeAmount`] for a negative total and
    /// [`LedgerError::Overflow`] if the intermediate product overflows.
    pub fn split(&self, total: i64) -> Result<SplitAmounts, LedgerError> {
        if total < 0 {
            return Err(LedgerError::NegativeAmount { amount: total });
        }
        let provider = Decimal::from(total)
            .checked_mul(self.provider_share)
            .ok_or(LedgerError::Overflow("provider share"))?
            .floor()
            .to_i64()
            .ok_or(LedgerError::Overflow("provider share"))?;
        let platform = total
            .checked_sub(provider)
            .ok_or(LedgerError::Overflow("platform share"))?;
        Ok(SplitAmounts {
            total,
            provider,
            platform,
        })
    }
}

impl Default for RevenueSplit {
    fn default() -> Self {
        Self {
            provider_share: DEFAULT_PROVIDER_SHARE,
        }
    }
}

impl TryFrom<Decimal> for RevenueSplit {
    type Error = LedgerError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RevenueSplit> for Decimal {
    fn from(split: RevenueSplit) -> Self {
        split.provider_share
    }
}

/// The three amounts of one settlement, in minor units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitAmounts {
    /// Amount charged to the payer.
    pub total: i64,
    /// Amount credited to the provider.
    pub provider: i64,
    /// Amount kept by the platform.
    pub platform: i64,
}

impl SplitAmounts {
    /// Whether provider and platform shares add back to the total.
    pub fn reconciles(&self) -> bool {
        self.provider.checked_add(self.platform) == Some(self.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_eighty_twenty() {
        let amounts = RevenueSplit::default().split(300).ok();
        assert_eq!(
            amounts,
            Some(SplitAmounts {
                total: 300,
                provider: 240,
                platform: 60,
            })
        );
    }

    #[test]
    fn remainder_goes_to_platform() {
        // 80% of 101 is 80.8: provider gets 80, platform 21.
        let amounts = RevenueSplit::default().split(101).ok();
        assert_eq!(amounts.map(|a| (a.provider, a.platform)), Some((80, 21)));
    }

    #[test]
    fn every_split_reconciles() {
        let split = RevenueSplit::new(Decimal::new(7, 1)).unwrap_or_default();
        for total in [0, 1, 7, 99, 100, 101, 12_345, 999_999] {
            let amounts = split.split(total).ok();
            assert!(amounts.is_some_and(|a| a.reconciles()), "total {total}");
            // The floor asymmetry never shifts more than one unit.
            let exact = Decimal::from(total) * Decimal::new(7, 1);
            let provider = amounts.map_or(0, |a| a.provider);
            assert!(exact - Decimal::from(provider) < Decimal::ONE);
        }
    }

    #[test]
    fn share_outside_unit_interval_is_rejected() {
        assert!(RevenueSplit::new(Decimal::new(101, 2)).is_err());
        assert!(RevenueSplit::new(Decimal::new(-1, 2)).is_err());
        assert!(RevenueSplit::new(Decimal::ONE).is_ok());
        assert!(RevenueSplit::new(Decimal::ZERO).is_ok());
    }

    #[test]
    fn deserializes_from_decimal_string() {
        let split: Result<RevenueSplit, _> = serde_json::from_str("\"0.75\"");
        assert_eq!(split.ok().map(|s| s.provider_share()), Some(Decimal::new(75, 2)));
        let bad: Result<RevenueSplit, _> = serde_json::from_str("\"1.5\"");
        assert!(bad.is_err());
    }
}
