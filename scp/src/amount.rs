//! Token amounts in base units.
//!
//! Every amount that crosses the wire (prices, fees, balances) is an unsigned
//! 256-bit integer encoded as a decimal string, e.g. `"1000000"` for one USDC.
//! [`TokenAmount`] wraps [`U256`] with that encoding and also accepts plain
//! JSON integers on input, since some peers send small balances as numbers.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use alloy_primitives::U256;
use rust_decimal::Decimal;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// An amount of a token in its smallest unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TokenAmount(pub U256);

/// Errors from parsing amounts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    /// Input is not a non-negative decimal integer.
    #[error("invalid amount: {0:?}")]
    Invalid(String),
    /// Human amount has more fractional digits than the token supports.
    #[error("amount {0:?} has more precision than the token allows")]
    TooPrecise(String),
    /// Value does not fit.
    #[error("amount {0:?} is out of range")]
    Overflow(String),
}

impl TokenAmount {
    /// Zero.
    pub const ZERO: Self = Self(U256::ZERO);

    /// Returns the inner value.
    #[must_use]
    pub const fn as_u256(&self) -> U256 {
        self.0
    }

    /// Returns `true` when the amount is zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Converts a human-readable amount such as `"1.5"` into base units.
    ///
    /// # Errors
    ///
    /// Fails on negative or malformed input, more fractional digits than
    /// `decimals`, or overflow.
    pub fn parse_units(human: &str, decimals: u8) -> Result<Self, AmountError> {
        let raw = human.trim();
        let value = Decimal::from_str(raw).map_err(|_| AmountError::Invalid(raw.to_owned()))?;
        if value.is_sign_negative() {
            return Err(AmountError::Invalid(raw.to_owned()));
        }
        if decimals > 28 {
            return Err(AmountError::Overflow(raw.to_owned()));
        }
        let scale = Decimal::from_i128_with_scale(10_i128.pow(u32::from(decimals)), 0);
        let scaled = value
            .checked_mul(scale)
            .ok_or_else(|| AmountError::Overflow(raw.to_owned()))?;
        if !scaled.fract().is_zero() {
            return Err(AmountError::TooPrecise(raw.to_owned()));
        }
        scaled.trunc().normalize().to_string().parse()
    }

    /// Renders the amount with a decimal point, trimming trailing zeros.
    #[must_use]
    pub fn format_units(&self, decimals: u8) -> String {
        let digits = self.0.to_string();
        let decimals = usize::from(decimals);
        if decimals == 0 {
            return digits;
        }
        let padded = format!("{digits:0>width$}", width = decimals + 1);
        let (whole, frac) = padded.split_at(padded.len() - decimals);
        let frac = frac.trim_end_matches('0');
        if frac.is_empty() {
            whole.to_owned()
        } else {
            format!("{whole}.{frac}")
        }
    }
}

impl FromStr for TokenAmount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AmountError::Invalid(s.to_owned()));
        }
        U256::from_str_radix(s, 10)
            .map(Self)
            .map_err(|_| AmountError::Overflow(s.to_owned()))
    }
}

impl Display for TokenAmount {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<U256> for TokenAmount {
    fn from(value: U256) -> Self {
        Self(value)
    }
}

impl From<u64> for TokenAmount {
    fn from(value: u64) -> Self {
        Self(U256::from(value))
    }
}

impl From<TokenAmount> for U256 {
    fn from(value: TokenAmount) -> Self {
        value.0
    }
}

impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AmountVisitor;

        impl Visitor<'_> for AmountVisitor {
            type Value = TokenAmount;

            fn expecting(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                f.write_str("a decimal integer string or a non-negative integer")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(TokenAmount::from(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                u64::try_from(v)
                    .map(TokenAmount::from)
                    .map_err(|_| E::custom("amount must not be negative"))
            }
        }

        deserializer.deserialize_any(AmountVisitor)
    }
}
