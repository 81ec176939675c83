//! Per-minute pricing.
//!
//! Every started minute is billed in full: 61 seconds is two minutes.

use crate::LedgerError;

/// Seconds in one billed minute.
pub const SECONDS_PER_MINUTE: u32 = 60;

/// Number of minutes billed for a reading of `duration_seconds`.
///
/// `ceil(duration_seconds / 60)`; a zero-length reading bills nothing.
pub const fn billable_minutes(duration_seconds: u32) -> u32 {
    duration_seconds.div_ceil(SECONDS_PER_MINUTE)
}

/// Cost of a reading in minor units: `billable_minutes * price_per_minute`.
///
/// # Errors
///
/// Returns [`LedgerError::NegativeAmount`] for a negative price and
/// [`LedgerError::Overflow`] if the product does not fit in an `i64`.
pub fn total_cost(duration_seconds: u32, price_per_minute: i64) -> Result<i64, LedgerError> {
    if price_per_minute < 0 {
        return Err(LedgerError::NegativeAmount {
            amount: price_per_minute,
        });
    }
    i64::from(billable_minutes(duration_seconds))
        .checked_mul(price_per_minute)
        .ok_or(LedgerError::Overflow("total cost"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minutes_round_up() {
        assert_eq!(billable_minutes(0), 0);
        assert_eq!(billable_minutes(1), 1);
        assert_eq!(billable_minutes(59), 1);
        assert_eq!(billable_minutes(60), 1);
        assert_eq!(billable_minutes(61), 2);
        assert_eq!(billable_minutes(125), 3);
        assert_eq!(billable_minutes(3599), 60);
        assert_eq!(billable_minutes(3600), 60);
    }

    #[test]
    fn cost_is_minutes_times_price() {
        for (seconds, expected) in [(1, 100), (59, 100), (60, 100), (61, 200), (3599, 6000), (3600, 6000)] {
            assert_eq!(total_cost(seconds, 100).ok(), Some(expected), "{seconds}s");
        }
    }

    #[test]
    fn cost_rejects_negative_price_and_overflow() {
        assert!(matches!(
            total_cost(60, -1),
            Err(LedgerError::NegativeAmount { amount: -1 })
        ));
        assert!(matches!(
            total_cost(u32::MAX, i64::MAX),
            Err(LedgerError::Overflow(_))
        ));
    }
}
