//! Kubernetes resource quantity handling
//!
//! Live objects may spell the same amount in many ways (`1`, `1000m`,
//! `1Gi`, `1073741824`, `1e3`). Comparing live and desired resources is done
//! on canonical integers: milli-cores for CPU and bytes for memory. Values
//! that do not divide evenly are rounded up, as the API server does.

use thiserror::Error;

use crate::sizing::ResourceKind;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid quantity `{input}`: {reason}")]
pub struct QuantityError {
    pub input: String,
    pub reason: String,
}

impl QuantityError {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Multiplier {
    /// Power of ten
    Decimal(i32),
    /// Power of 1024
    Binary(u32),
}

const BINARY_SUFFIXES: [(&str, u32); 6] = [
    ("Ki", 1),
    ("Mi", 2),
    ("Gi", 3),
    ("Ti", 4),
    ("Pi", 5),
    ("Ei", 6),
];

fn parse_suffix(input: &str, suffix: &str) -> Result<Multiplier, QuantityError> {
    if let Some((_, power)) = BINARY_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        return Ok(Multiplier::Binary(*power));
    }

    let exp = match suffix {
        "" => 0,
        "n" => -9,
        "u" => -6,
        "m" => -3,
        "k" => 3,
        "M" => 6,
        "G" => 9,
        "T" => 12,
        "P" => 15,
        "E" => 18,
        s if s.starts_with(|c: char| c == 'e' || c == 'E') && s.len() > 1 => s[1..]
            .parse::<i32>()
            .map_err(|_| QuantityError::new(input, format!("bad exponent `{}`", s)))?,
        s => return Err(QuantityError::new(input, format!("unknown suffix `{}`", s))),
    };
    Ok(Multiplier::Decimal(exp))
}

fn pow10(exp: u32) -> Option<i128> {
    10i128.checked_pow(exp)
}

/// Parse `input` into an integer count of `10^unit_exp` units, rounding up
fn parse_scaled(input: &str, unit_exp: i32) -> Result<i64, QuantityError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(QuantityError::new(input, "empty quantity"));
    }

    let (negative, body) = match trimmed.as_bytes()[0] {
        b'-' => (true, &trimmed[1..]),
        b'+' => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };

    let number_end = body
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(body.len());
    let (number, suffix) = body.split_at(number_end);
    if number.is_empty() || number == "." {
        return Err(QuantityError::new(input, "missing numeric part"));
    }

    let (whole, fraction) = match number.split_once('.') {
        Some((w, f)) => (w, f),
        None => (number, ""),
    };
    let digits = format!("{}{}", whole, fraction);
    let overflow = || QuantityError::new(input, "value out of range");

    let mantissa: i128 = digits.parse().map_err(|_| overflow())?;
    let frac_digits = u32::try_from(fraction.len()).map_err(|_| overflow())?;

    let mut numerator = mantissa;
    let mut denominator = pow10(frac_digits).ok_or_else(overflow)?;

    match parse_suffix(input, suffix)? {
        Multiplier::Binary(power) => {
            let factor = 1024i128.checked_pow(power).ok_or_else(overflow)?;
            numerator = numerator.checked_mul(factor).ok_or_else(overflow)?;
            let unit = pow10(unit_exp.unsigned_abs()).ok_or_else(overflow)?;
            if unit_exp < 0 {
                numerator = numerator.checked_mul(unit).ok_or_else(overflow)?;
            } else {
                denominator = denominator.checked_mul(unit).ok_or_else(overflow)?;
            }
        }
        Multiplier::Decimal(exp) => {
            let shift = exp.checked_sub(unit_exp).ok_or_else(overflow)?;
            let factor = pow10(shift.unsigned_abs()).ok_or_else(overflow)?;
            if shift >= 0 {
                numerator = numerator.checked_mul(factor).ok_or_else(overflow)?;
            } else {
                denominator = denominator.checked_mul(factor).ok_or_else(overflow)?;
            }
        }
    }

    let mut value = numerator / denominator;
    if numerator % denominator != 0 {
        value += 1;
    }
    if negative {
        value = -value;
    }

    i64::try_from(value).map_err(|_| overflow())
}

/// Parse a CPU quantity into milli-cores
pub fn parse_cpu_millis(input: &str) -> Result<i64, QuantityError> {
    parse_scaled(input, -3)
}

/// Parse a memory quantity into bytes
pub fn parse_memory_bytes(input: &str) -> Result<i64, QuantityError> {
    parse_scaled(input, 0)
}

/// Canonical integer for a quantity of the given kind
pub fn canonical(kind: ResourceKind, input: &str) -> Result<i64, QuantityError> {
    match kind {
        ResourceKind::Cpu => parse_cpu_millis(input),
        ResourceKind::Memory => parse_memory_bytes(input),
    }
}

/// Format milli-cores the way the API server serializes them
pub fn format_cpu_millis(millis: i64) -> String {
    if millis % 1000 == 0 {
        format!("{}", millis / 1000)
    } else {
        format!("{}m", millis)
    }
}

/// Format bytes using the largest exact binary suffix
pub fn format_memory_bytes(bytes: i64) -> String {
    if bytes != 0 {
        for (suffix, power) in BINARY_SUFFIXES.iter().rev() {
            let unit = 1i64 << (10 * power);
            if bytes % unit == 0 {
                return format!("{}{}", bytes / unit, suffix);
            }
        }
    }
    format!("{}", bytes)
}

/// Format a canonical amount of the given kind
pub fn format(kind: ResourceKind, amount: i64) -> String {
    match kind {
        ResourceKind::Cpu => format_cpu_millis(amount),
        ResourceKind::Memory => format_memory_bytes(amount),
    }
}
