//! Channel funding policy.
//!
//! A channel is funded for `topup_payments` payments at a time and topped
//! back up once fewer than `low_water_payments` remain. The plan is derived
//! fresh for every offer and never stored.

use alloy_primitives::U256;
use scp::amount::TokenAmount;

/// Funding decision for one offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FundingPlan {
    /// Debit of one payment: price plus hub fee.
    pub per_pay: TokenAmount,
    /// Payments a top-up covers, at least one.
    pub topup_payments: u64,
    /// Balance a top-up aims for.
    pub target: TokenAmount,
    /// Balance below which the channel is topped up.
    pub refill_at: TokenAmount,
    /// Current payer balance, zero without a channel.
    pub cur_bal: TokenAmount,
    /// Amount to open with or deposit.
    pub needed: TokenAmount,
    /// No channel exists yet.
    pub needs_open: bool,
    /// The channel exists but is below the refill mark.
    pub needs_fund: bool,
}

impl FundingPlan {
    /// Plans funding for payments of `per_pay` against a channel holding
    /// `balance` (`None` when no channel exists yet).
    #[must_use]
    pub fn compute(
        per_pay: TokenAmount,
        balance: Option<TokenAmount>,
        topup_payments: u64,
        low_water_payments: u64,
    ) -> Self {
        let topup_payments = topup_payments.max(1);
        let target = per_pay.0.saturating_mul(U256::from(topup_payments));
        let refill_at = per_pay
            .0
            .saturating_mul(U256::from(low_water_payments.min(topup_payments)));
        let cur_bal = balance.unwrap_or_default().0;
        let needs_open = balance.is_none();
        let needs_fund = !needs_open && cur_bal < refill_at.max(per_pay.0);
        let needed = if needs_open {
            target
        } else if needs_fund {
            target.saturating_sub(cur_bal)
        } else {
            U256::ZERO
        };
        Self {
            per_pay,
            topup_payments,
            target: TokenAmount(target),
            refill_at: TokenAmount(refill_at),
            cur_bal: TokenAmount(cur_bal),
            needed: TokenAmount(needed),
            needs_open,
            needs_fund,
        }
    }

    /// Whether an on-chain transaction is needed before paying.
    #[must_use]
    pub const fn needs_action(&self) -> bool {
        self.needs_open || self.needs_fund
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amt(n: u64) -> TokenAmount {
        TokenAmount::from(n)
    }

    #[test]
    fn low_balance_needs_a_topup() {
        let plan = FundingPlan::compute(amt(1010), Some(amt(9000)), 100, 10);
        assert_eq!(plan.target, amt(101_000));
        assert_eq!(plan.refill_at, amt(10_100));
        assert!(plan.needs_fund);
        assert!(!plan.needs_open);
        assert_eq!(plan.needed, amt(92_000));
    }

    #[test]
    fn healthy_channel_is_left_alone() {
        let plan = FundingPlan::compute(amt(1010), Some(amt(50_000)), 100, 10);
        assert!(!plan.needs_action());
        assert_eq!(plan.needed, TokenAmount::ZERO);
    }

    #[test]
    fn missing_channel_opens_at_target() {
        let plan = FundingPlan::compute(amt(1010), None, 100, 10);
        assert!(plan.needs_open);
        assert!(!plan.needs_fund);
        assert_eq!(plan.needed, amt(101_000));
        assert_eq!(plan.cur_bal, TokenAmount::ZERO);
    }

    #[test]
    fn low_water_is_capped_by_topup() {
        let plan = FundingPlan::compute(amt(100), Some(amt(250)), 3, 10);
        assert_eq!(plan.target, amt(300));
        assert_eq!(plan.refill_at, amt(300));
        assert!(plan.needs_fund);
        assert_eq!(plan.needed, amt(50));
    }
}
