use crate::error::EngineError;
use std::collections::HashMap;

/// Extract a parameter as f64 with a default value
pub fn get_param_f64(params: &HashMap<String, f64>, key: &str, default: f64) -> f64 {
    params
        .get(key)
        .copied()
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

/// Extract a parameter as usize with a default value. Negative values collapse to zero.
pub fn get_param_usize(params: &HashMap<String, f64>, key: &str, default: usize) -> usize {
    params
        .get(key)
        .copied()
        .filter(|v| v.is_finite())
        .map(|v| v.round().max(0.0) as usize)
        .unwrap_or(default)
}

/// Interpret a parameter as a flag (>= 0.5 is on)
pub fn get_param_flag(params: &HashMap<String, f64>, key: &str, default: bool) -> bool {
    params
        .get(key)
        .copied()
        .filter(|v| v.is_finite())
        .map(|v| v >= 0.5)
        .unwrap_or(default)
}

/// Fetch a parameter that must be present and finite
pub fn require_param_f64(
    params: &HashMap<String, f64>,
    owner: &str,
    key: &str,
) -> Result<f64, EngineError> {
    let value = params
        .get(key)
        .copied()
        .ok_or_else(|| EngineError::missing(owner, key))?;
    if !value.is_finite() {
        return Err(EngineError::invalid(
            key,
            format!("must be finite (value: {})", value),
        ));
    }
    Ok(value)
}

/// Fetch a required period-like parameter, rounded to a non-negative integer
pub fn require_param_usize(
    params: &HashMap<String, f64>,
    owner: &str,
    key: &str,
) -> Result<usize, EngineError> {
    require_param_f64(params, owner, key).map(|value| value.round().max(0.0) as usize)
}
