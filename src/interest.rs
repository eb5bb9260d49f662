//! Interest math shared by the reconciliation pipeline, the loan
//! application intake, and the calculator endpoint.
//!
//! The rate is a pure function of the requested principal and is recomputed
//! wherever it is needed; it is never stored as an independent input. Every
//! call site must go through this module so the three paths can never drift.

use bigdecimal::{BigDecimal, ToPrimitive};
use std::str::FromStr;

/// Rate applied to principals outside every bracket (including zero,
/// negative, and amounts under the 10,000 minimum).
pub const FALLBACK_RATE: f64 = 0.20;

/// Bracketed interest rate for a requested principal.
///
/// 10,000..=50,000 -> 15%, 50,000..=150,000 (exclusive lower bound) -> 10%,
/// above 150,000 -> 7%, anything else -> the 20% fallback.
pub fn rate(principal: f64) -> f64 {
    if (10_000.0..=50_000.0).contains(&principal) {
        0.15
    } else if principal > 50_000.0 && principal <= 150_000.0 {
        0.10
    } else if principal > 150_000.0 {
        0.07
    } else {
        FALLBACK_RATE
    }
}

/// Principal plus interest: `p + p * rate(p)`.
pub fn total_repayment(principal: f64) -> f64 {
    principal + principal * rate(principal)
}

/// Outstanding balance. Recomputed every time a loan is touched, never
/// independently settable.
pub fn balance(total_repayment: f64, amount_paid: f64) -> f64 {
    total_repayment - amount_paid
}

/// Convert a computed f64 amount to the NUMERIC storage representation,
/// rounded to 2 decimal places.
pub fn money(value: f64) -> BigDecimal {
    BigDecimal::from_str(&format!("{:.2}", value))
        .unwrap_or_else(|_| BigDecimal::from(0))
}

/// Read a NUMERIC column back into f64 for recomputation.
pub fn money_f64(value: &BigDecimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}
