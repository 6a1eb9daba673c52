//! Hub fee policy.
//!
//! `fee = base + amount * bps / 10000 + gasSurcharge`, with the variable part
//! floored. The payer is debited `amount + fee`.

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, PickFirst, serde_as};

use crate::amount::TokenAmount;

/// Basis-point denominator.
pub const BPS_DENOMINATOR: u64 = 10_000;

/// Fee parameters a hub advertises in its `/.well-known/x402` document.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeePolicy {
    /// Flat fee per payment.
    #[serde(default)]
    pub base: TokenAmount,
    /// Proportional fee in basis points. Accepts `30` or `"30"`.
    #[serde(default)]
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub bps: u64,
    /// Flat gas surcharge per payment.
    #[serde(default)]
    pub gas_surcharge: TokenAmount,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            base: TokenAmount::from(10),
            bps: 30,
            gas_surcharge: TokenAmount::ZERO,
        }
    }
}

/// Itemised fee, echoed back in a quote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeBreakdown {
    /// Flat fee.
    pub base: TokenAmount,
    /// Basis points applied.
    pub bps: u64,
    /// `amount * bps / 10000`.
    pub variable: TokenAmount,
    /// Gas surcharge.
    pub gas_surcharge: TokenAmount,
}

/// Result of applying a [`FeePolicy`] to an amount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeQuote {
    /// Total fee.
    pub fee: TokenAmount,
    /// `amount + fee`.
    pub total_debit: TokenAmount,
    /// Fee components.
    pub breakdown: FeeBreakdown,
}

impl FeePolicy {
    /// Computes the fee for `amount`, or `None` on overflow.
    #[must_use]
    pub fn compute(&self, amount: TokenAmount) -> Option<FeeQuote> {
        let variable = amount
            .0
            .checked_mul(U256::from(self.bps))?
            .checked_div(U256::from(BPS_DENOMINATOR))?;
        let fee = self
            .base
            .0
            .checked_add(variable)?
            .checked_add(self.gas_surcharge.0)?;
        let total_debit = amount.0.checked_add(fee)?;
        Some(FeeQuote {
            fee: fee.into(),
            total_debit: total_debit.into(),
            breakdown: FeeBreakdown {
                base: self.base,
                bps: self.bps,
                variable: variable.into(),
                gas_surcharge: self.gas_surcharge,
            },
        })
    }

    /// Fee only, treating overflow as zero fee. Used for funding estimates.
    #[must_use]
    pub fn fee_for(&self, amount: TokenAmount) -> TokenAmount {
        self.compute(amount).map_or(TokenAmount::ZERO, |q| q.fee)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_on_one_usdc() {
        let policy: FeePolicy =
            serde_json::from_str(r#"{"base":"10","bps":30,"gasSurcharge":"0"}"#).unwrap();
        let quote = policy.compute(TokenAmount::from(1_000_000)).unwrap();
        assert_eq!(quote.fee, TokenAmount::from(3010));
        assert_eq!(quote.total_debit, TokenAmount::from(1_003_010));
        assert_eq!(quote.breakdown.variable, TokenAmount::from(3000));
    }

    #[test]
    fn variable_part_is_floored() {
        let policy = FeePolicy {
            base: TokenAmount::ZERO,
            bps: 30,
            gas_surcharge: TokenAmount::from(5),
        };
        // 999 * 30 / 10000 = 2.997
        let quote = policy.compute(TokenAmount::from(999)).unwrap();
        assert_eq!(quote.breakdown.variable, TokenAmount::from(2));
        assert_eq!(quote.fee, TokenAmount::from(7));
    }

    #[test]
    fn bps_may_arrive_as_string() {
        let policy: FeePolicy = serde_json::from_str(r#"{"base":"1","bps":"25"}"#).unwrap();
        assert_eq!(policy.bps, 25);
        assert_eq!(policy.gas_surcharge, TokenAmount::ZERO);
    }

    #[test]
    fn overflow_is_reported() {
        let policy = FeePolicy::default();
        assert!(policy.compute(TokenAmount(U256::MAX)).is_none());
    }
}
