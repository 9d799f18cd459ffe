//! Fixed-point helpers for basis-point and ratio arithmetic.
//!
//! Products are carried in 256 bits, so only a result that does not fit in
//! `u128` fails. Overflow never wraps: it surfaces as an `ArithmeticError` so
//! the enclosing dispatchable aborts.

use crate::{BasisPoints, Rounding, MAX_BPS};
use sp_runtime::helpers_128bit::multiply_by_rational_with_rounding;
use sp_runtime::ArithmeticError;

/// `value * bps / 10_000`, truncated.
pub fn bps_of(value: u128, bps: BasisPoints) -> Result<u128, ArithmeticError> {
    mul_div(value, bps as u128, MAX_BPS as u128, Rounding::Down)
}

/// Share of `part` in `whole` expressed in basis points. Zero when `whole`
/// is zero.
pub fn to_bps(part: u128, whole: u128) -> Result<BasisPoints, ArithmeticError> {
    if whole == 0 {
        return Ok(0);
    }
    let bps = mul_div(part, MAX_BPS as u128, whole, Rounding::Down)?;
    BasisPoints::try_from(bps).map_err(|_| ArithmeticError::Overflow)
}

/// `a - b`, floored at zero.
pub fn safe_sub(a: u128, b: u128) -> u128 {
    a.saturating_sub(b)
}

/// `a * b / denominator` with an explicit rounding direction.
pub fn mul_div(
    a: u128,
    b: u128,
    denominator: u128,
    rounding: Rounding,
) -> Result<u128, ArithmeticError> {
    if denominator == 0 {
        return Err(ArithmeticError::DivisionByZero);
    }
    multiply_by_rational_with_rounding(a, b, denominator, rounding).ok_or(ArithmeticError::Overflow)
}
