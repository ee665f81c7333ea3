//! Fixed-point amount parsing, quantization and fee splits.
//!
//! Every monetary value in the gate is a [`Decimal`] quantized to
//! [`AMOUNT_SCALE`] fractional digits. Binary floating point never touches an
//! amount: numbers coming from JSON or TOML are re-parsed from their textual
//! form.

use std::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Deserializer};

/// Number of fractional digits every amount is quantized to.
pub const AMOUNT_SCALE: u32 = 8;

/// Errors produced while parsing or splitting an amount.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    /// The input is not a decimal number.
    #[error("invalid amount {0:?}")]
    Invalid(String),
    /// The input parsed but is below zero.
    #[error("amount must not be negative: {0}")]
    Negative(Decimal),
    /// A fee percentage outside `0..=100`.
    #[error("fee percent must be between 0 and 100, got {0}")]
    FeePercent(Decimal),
    /// Arithmetic left the representable range.
    #[error("amount arithmetic overflowed")]
    Overflow,
}

/// Rounds `amount` to [`AMOUNT_SCALE`] digits using banker's rounding.
#[must_use]
pub fn quantize(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::MidpointNearestEven)
}

/// Renders an amount as minimal decimal text (`0.75`, `1`, `0.00000001`).
#[must_use]
pub fn format_amount(amount: Decimal) -> String {
    quantize(amount).normalize().to_string()
}

/// Parses a non-negative amount from text, accepting plain or scientific notation.
///
/// # Errors
///
/// Returns [`AmountError::Invalid`] for non-numeric input and
/// [`AmountError::Negative`] for values below zero.
pub fn parse_amount(input: &str) -> Result<Decimal, AmountError> {
    let trimmed = input.trim();
    let value = Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .map_err(|_| AmountError::Invalid(input.to_owned()))?;
    if value.is_sign_negative() && !value.is_zero() {
        return Err(AmountError::Negative(value));
    }
    Ok(quantize(value))
}

/// Parses an amount from a loosely typed JSON value (string or number).
///
/// # Errors
///
/// Returns [`AmountError`] when the value is neither a numeric string nor a
/// number, or is negative.
pub fn amount_from_value(value: &serde_json::Value) -> Result<Decimal, AmountError> {
    match value {
        serde_json::Value::String(s) => parse_amount(s),
        serde_json::Value::Number(n) => parse_amount(&n.to_string()),
        other => Err(AmountError::Invalid(other.to_string())),
    }
}

/// Platform fee and merchant remainder of a gross payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSplit {
    /// Platform share, quantized.
    pub fee: Decimal,
    /// What remains for the merchant, quantized.
    pub merchant: Decimal,
}

impl FeeSplit {
    /// Splits `amount` with `fee_percent` percent going to the platform.
    ///
    /// `fee = amount * fee_percent / 100` and `merchant = amount - fee`, both
    /// quantized, so `fee + merchant` reconstructs the quantized amount.
    ///
    /// # Errors
    ///
    /// Returns [`AmountError::FeePercent`] for percentages outside `0..=100`
    /// and [`AmountError::Overflow`] if the multiplication overflows.
    pub fn compute(amount: Decimal, fee_percent: Decimal) -> Result<Self, AmountError> {
        if fee_percent < Decimal::ZERO || fee_percent > Decimal::ONE_HUNDRED {
            return Err(AmountError::FeePercent(fee_percent));
        }
        let amount = quantize(amount);
        let fee = amount
            .checked_mul(fee_percent)
            .and_then(|v| v.checked_div(Decimal::ONE_HUNDRED))
            .map(quantize)
            .ok_or(AmountError::Overflow)?;
        let merchant = quantize(amount - fee);
        Ok(Self { fee, merchant })
    }
}

/// Serde helper for optional amounts written as strings or numbers.
///
/// ```ignore
/// #[serde(default, deserialize_with = "b402::amount::deserialize_opt_amount")]
/// default_price: Option<Decimal>,
/// ```
///
/// # Errors
///
/// Fails deserialization when a value is present but not a valid amount.
pub fn deserialize_opt_amount<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    match raw {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => amount_from_value(&value)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}
