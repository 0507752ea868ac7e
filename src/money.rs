//! Human-readable token amount parsing and scaling.
//!
//! Prices in the pricing table and the discovery document are decimal
//! strings in the token's display unit (`"0.005"`). On the wire and on the
//! ledger, amounts are integers in the token's smallest unit. [`MoneyAmount`]
//! parses the human form and scales it with integer arithmetic only; binary
//! floating point never touches an amount.

use alloy::primitives::U256;
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use std::fmt;
use std::fmt::Display;
use std::ops::Mul;
use std::str::FromStr;

/// A non-negative decimal amount in the token's display unit.
///
/// Parsed from strings like `"0.005"`, `"$10.50"`, or `"1,000"`; currency
/// symbols and thousand separators are stripped. The original precision is
/// preserved so it can be checked against the token's decimal places before
/// scaling.
#[derive(Debug, Clone, PartialEq)]
pub struct MoneyAmount(Decimal);

/// Errors produced while parsing or scaling a [`MoneyAmount`].
#[derive(Debug, thiserror::Error)]
pub enum InvalidAmount {
    /// The input string could not be parsed as a number.
    #[error("Invalid number format")]
    Format,
    /// The value is zero, negative, or outside the allowed range.
    #[error("Amount must be positive and at most {}", bounds::MAX_STR)]
    OutOfRange,
    /// The input has more fractional digits than the token supports.
    #[error("Too precise: {money} fractional digits vs {token} on token")]
    TooPrecise { money: u32, token: u32 },
}

mod bounds {
    use super::*;

    pub const MAX_STR: &str = "999999999";

    pub static MAX: Lazy<Decimal> =
        Lazy::new(|| Decimal::from_str(MAX_STR).expect("valid decimal"));
}

static NON_NUMERIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\d\.\-]+").expect("valid regex"));

impl MoneyAmount {
    /// Parses a display-unit amount.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidAmount`] if the string is not a number, or the value
    /// is non-positive or outside the allowed range.
    pub fn parse(input: &str) -> Result<Self, InvalidAmount> {
        let cleaned = NON_NUMERIC.replace_all(input, "");
        let parsed = Decimal::from_str(&cleaned).map_err(|_| InvalidAmount::Format)?;
        if parsed.is_sign_negative() || parsed.is_zero() || parsed > *bounds::MAX {
            return Err(InvalidAmount::OutOfRange);
        }
        Ok(MoneyAmount(parsed))
    }

    /// Number of fractional digits in the original input.
    pub fn scale(&self) -> u32 {
        self.0.scale()
    }

    /// The value with the decimal point removed, e.g. `"10.50"` → `1050`.
    pub fn mantissa(&self) -> u128 {
        self.0.mantissa().unsigned_abs()
    }

    /// Scales this amount to smallest units for a token with
    /// `token_decimals` decimal places.
    ///
    /// `"0.005"` with 6 decimals becomes `5000`. Fails when the input
    /// carries more fractional digits than the token can represent, so no
    /// silent truncation can occur.
    pub fn as_token_amount(&self, token_decimals: u32) -> Result<U256, InvalidAmount> {
        let money_decimals = self.scale();
        if money_decimals > token_decimals {
            return Err(InvalidAmount::TooPrecise {
                money: money_decimals,
                token: token_decimals,
            });
        }
        let scale_diff = token_decimals - money_decimals;
        let multiplier = U256::from(10).pow(U256::from(scale_diff));
        Ok(U256::from(self.mantissa()).mul(multiplier))
    }
}

/// Renders a smallest-unit amount back into the display unit.
///
/// The inverse of [`MoneyAmount::as_token_amount`]: trailing fractional
/// zeros are trimmed, so `5000` with 6 decimals renders as `"0.005"` and
/// `1000000` as `"1"`.
pub fn format_token_amount(amount: U256, token_decimals: u32) -> String {
    let digits = amount.to_string();
    let decimals = token_decimals as usize;
    let (int_part, frac_part) = if digits.len() > decimals {
        let split = digits.len() - decimals;
        (digits[..split].to_string(), digits[split..].to_string())
    } else {
        ("0".to_string(), format!("{digits:0>decimals$}"))
    };
    let frac_part = frac_part.trim_end_matches('0');
    if frac_part.is_empty() {
        int_part
    } else {
        format!("{int_part}.{frac_part}")
    }
}

impl FromStr for MoneyAmount {
    type Err = InvalidAmount;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MoneyAmount::parse(s)
    }
}

impl TryFrom<&str> for MoneyAmount {
    type Error = InvalidAmount;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        MoneyAmount::from_str(value)
    }
}

impl Display for MoneyAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_scales_to_smallest_units() {
        let amount = MoneyAmount::parse("0.005").unwrap();
        assert_eq!(amount.as_token_amount(6).unwrap(), U256::from(5000u64));
    }

    #[test]
    fn test_whole_amount() {
        let amount = MoneyAmount::parse("3").unwrap();
        assert_eq!(amount.as_token_amount(6).unwrap(), U256::from(3_000_000u64));
    }

    #[test]
    fn test_strips_currency_symbols() {
        let amount = MoneyAmount::parse("$1,000.25").unwrap();
        assert_eq!(amount.as_token_amount(2).unwrap(), U256::from(100025u64));
    }

    #[test]
    fn test_rejects_zero_and_negative() {
        assert!(matches!(
            MoneyAmount::parse("0"),
            Err(InvalidAmount::OutOfRange)
        ));
        assert!(matches!(
            MoneyAmount::parse("-0.01"),
            Err(InvalidAmount::OutOfRange)
        ));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            MoneyAmount::parse("not a number"),
            Err(InvalidAmount::Format)
        ));
    }

    #[test]
    fn test_rejects_excess_precision() {
        let amount = MoneyAmount::parse("0.0000001").unwrap();
        assert!(matches!(
            amount.as_token_amount(6),
            Err(InvalidAmount::TooPrecise { money: 7, token: 6 })
        ));
    }

    #[test]
    fn test_format_token_amount() {
        assert_eq!(format_token_amount(U256::from(5000u64), 6), "0.005");
        assert_eq!(format_token_amount(U256::from(1_000_000u64), 6), "1");
        assert_eq!(format_token_amount(U256::from(1_500_000u64), 6), "1.5");
        assert_eq!(format_token_amount(U256::ZERO, 6), "0");
    }

    #[test]
    fn test_scaling_roundtrip_random() {
        // display -> smallest -> display survives for amounts with <= 6
        // fractional digits.
        let mut rng = rand::rng();
        for _ in 0..256 {
            let int_part = rng.random_range(0u64..1_000_000);
            let frac_digits = rng.random_range(0u32..=6);
            let display = if frac_digits == 0 {
                if int_part == 0 {
                    continue;
                }
                int_part.to_string()
            } else {
                let frac_max = 10u64.pow(frac_digits);
                let mut frac = rng.random_range(0u64..frac_max);
                if int_part == 0 && frac == 0 {
                    frac = 1;
                }
                let raw = format!("{int_part}.{frac:0width$}", width = frac_digits as usize);
                // Normalize trailing zeros the way format_token_amount does.
                let trimmed = raw.trim_end_matches('0').trim_end_matches('.');
                trimmed.to_string()
            };
            let amount = MoneyAmount::parse(&display).unwrap();
            let smallest = amount.as_token_amount(6).unwrap();
            assert_eq!(format_token_amount(smallest, 6), display, "input {display}");
        }
    }
}
