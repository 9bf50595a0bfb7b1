//! plausibility checks for temperature/humidity pairs
//!
//! bounds are fixed; anything outside them is rejected before it reaches any
//! other component.

use crate::error::Rejection;

pub const TEMPERATURE_MIN: f64 = -50.0;
pub const TEMPERATURE_MAX: f64 = 80.0;
pub const HUMIDITY_MIN: f64 = 0.0;
pub const HUMIDITY_MAX: f64 = 100.0;

/// true iff both values are inside the physical bounds (inclusive)
///
/// NaN compares false against everything, so it fails here without a special case.
pub fn is_plausible(temperature: f64, humidity: f64) -> bool {
    (TEMPERATURE_MIN..=TEMPERATURE_MAX).contains(&temperature)
        && (HUMIDITY_MIN..=HUMIDITY_MAX).contains(&humidity)
}

/// same check for values that arrive as text; non-numeric input is `false`
pub fn is_plausible_text(temperature: &str, humidity: &str) -> bool {
    match (parse_number(temperature), parse_number(humidity)) {
        (Some(t), Some(h)) => is_plausible(t, h),
        _ => false,
    }
}

/// turns the two raw push fields into a plausible pair or the reason it is not one
pub fn coerce_pair(temperature: Option<&str>, humidity: Option<&str>) -> Result<(f64, f64), Rejection> {
    let (t, h) = match (temperature, humidity) {
        (Some(t), Some(h)) if !t.trim().is_empty() && !h.trim().is_empty() => (t, h),
        _ => return Err(Rejection::MissingFields),
    };

    let (t, h) = match (parse_number(t), parse_number(h)) {
        (Some(t), Some(h)) => (t, h),
        _ => return Err(Rejection::NonNumeric),
    };

    if !is_plausible(t, h) {
        return Err(Rejection::OutOfRange);
    }
    Ok((t, h))
}

/// finite decimal number or nothing ("inf" and "NaN" are not readings)
pub(crate) fn parse_number(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}
