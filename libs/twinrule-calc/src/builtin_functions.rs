//! Stateless numeric helpers behind `ABS`, `ROUND` and `CLAMP`

/// Clamp value to range [min, max]
pub fn clamp(value: f64, min: f64, max: f64) -> f64 {
    value.max(min).min(max)
}

/// Absolute value
pub fn abs(value: f64) -> f64 {
    value.abs()
}

/// Round to specified decimal places
pub fn round(value: f64, decimals: i32) -> f64 {
    let factor = 10_f64.powi(decimals);
    (value * factor).round() / factor
}
