//! Resource quantities such as `500m`, `1.5`, `128Mi` or `2G`.
//!
//! Only the plain decimal notation with an optional suffix is accepted:
//! milli (`m`), decimal SI (`k`, `M`, `G`, `T`, `P`, `E`) and binary SI
//! (`Ki`, `Mi`, `Gi`, `Ti`, `Pi`, `Ei`). Values are rounded up, never down.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Quantity parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,

    #[error("malformed number")]
    Malformed,

    #[error("unknown suffix {0:?}")]
    UnknownSuffix(String),

    #[error("negative quantities are not allowed")]
    Negative,

    #[error("value out of range")]
    Overflow,
}

/// A resource quantity in its textual form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(String);

impl Quantity {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Value in whole units, rounded up (bytes for memory, cores for CPU).
    pub fn value(&self) -> Result<i64, QuantityError> {
        self.scaled(1)
    }

    /// Value in thousandths of a unit, rounded up.
    pub fn milli_value(&self) -> Result<i64, QuantityError> {
        self.scaled(1000)
    }

    fn scaled(&self, scale: i128) -> Result<i64, QuantityError> {
        let parsed = parse(self.0.trim())?;
        let numerator = parsed
            .digits
            .checked_mul(parsed.multiplier)
            .and_then(|v| v.checked_mul(scale))
            .ok_or(QuantityError::Overflow)?;
        let denominator = parsed
            .fraction_scale
            .checked_mul(parsed.divisor)
            .ok_or(QuantityError::Overflow)?;

        // Ceiling division on non-negative operands.
        let value = (numerator + denominator - 1) / denominator;
        i64::try_from(value).map_err(|_| QuantityError::Overflow)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Quantity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// `digits / fraction_scale * multiplier / divisor`
struct Parsed {
    digits: i128,
    fraction_scale: i128,
    multiplier: i128,
    divisor: i128,
}

fn parse(s: &str) -> Result<Parsed, QuantityError> {
    if s.is_empty() {
        return Err(QuantityError::Empty);
    }
    if s.starts_with('-') {
        return Err(QuantityError::Negative);
    }
    let s = s.strip_prefix('+').unwrap_or(s);

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);

    let (multiplier, divisor) = suffix_factor(suffix)?;

    let (whole, fraction) = match number.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (number, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return Err(QuantityError::Malformed);
    }
    if fraction.contains('.') {
        return Err(QuantityError::Malformed);
    }

    let mut digits: i128 = 0;
    for c in whole.chars().chain(fraction.chars()) {
        let d = c.to_digit(10).ok_or(QuantityError::Malformed)?;
        digits = digits
            .checked_mul(10)
            .and_then(|v| v.checked_add(i128::from(d)))
            .ok_or(QuantityError::Overflow)?;
    }
    let exponent = u32::try_from(fraction.len()).map_err(|_| QuantityError::Overflow)?;
    let fraction_scale = 10i128.checked_pow(exponent).ok_or(QuantityError::Overflow)?;

    Ok(Parsed {
        digits,
        fraction_scale,
        multiplier,
        divisor,
    })
}

fn suffix_factor(suffix: &str) -> Result<(i128, i128), QuantityError> {
    let factor = match suffix {
        "" => (1, 1),
        "m" => (1, 1000),
        "k" => (1_000, 1),
        "M" => (1_000_000, 1),
        "G" => (1_000_000_000, 1),
        "T" => (1_000_000_000_000, 1),
        "P" => (1_000_000_000_000_000, 1),
        "E" => (1_000_000_000_000_000_000, 1),
        "Ki" => (1 << 10, 1),
        "Mi" => (1 << 20, 1),
        "Gi" => (1 << 30, 1),
        "Ti" => (1 << 40, 1),
        "Pi" => (1 << 50, 1),
        "Ei" => (1 << 60, 1),
        other => return Err(QuantityError::UnknownSuffix(other.to_string())),
    };
    Ok(factor)
}
