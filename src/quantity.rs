// =============================================================================
// Exact-decimal quantity arithmetic for order sizing
// =============================================================================
//
// Order quantities must be floored to the pair's lot step and rendered as
// plain decimal strings. Binary floating point never touches this path.
// =============================================================================

use rust_decimal::Decimal;

use crate::error::{RebalancerError, Result};

/// Floor `quantity` to the largest multiple of `step_size`.
///
/// `step_size` arrives as the exchange's decimal string (e.g. `"0.00100000"`).
/// A non-positive or unparseable step is a contract violation.
pub fn adjust_to_step(quantity: Decimal, step_size: &str) -> Result<Decimal> {
    let step: Decimal = step_size.trim().parse().map_err(|_| {
        RebalancerError::InvalidInput(format!("invalid step size: {step_size:?}"))
    })?;

    if step <= Decimal::ZERO {
        return Err(RebalancerError::InvalidInput(format!(
            "step size must be positive, got {step_size:?}"
        )));
    }

    Ok((quantity / step).floor() * step)
}

/// Render a quantity as a plain decimal string for the exchange API: no
/// exponent notation, no trailing zeros after the point, no trailing dot.
pub fn format_for_api(quantity: Decimal) -> String {
    let rendered = quantity.to_string();
    if rendered.contains('.') {
        rendered
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string()
    } else {
        rendered
    }
}
