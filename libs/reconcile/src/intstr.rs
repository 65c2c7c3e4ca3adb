//! Integer-or-percentage values and small numeric helpers.

use serde::{Deserialize, Serialize};

use crate::ReconcileError;

/// A count given either as an absolute integer or as a percentage string
/// such as `"25%"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntOrPercent {
    Int(i32),
    Percent(String),
}

impl Default for IntOrPercent {
    fn default() -> Self {
        IntOrPercent::Int(1)
    }
}

impl IntOrPercent {
    /// Resolve against `total`, rounding percentages up or down.
    pub fn scaled_value(&self, total: i32, round_up: bool) -> Result<i32, ReconcileError> {
        match self {
            IntOrPercent::Int(v) => Ok(*v),
            IntOrPercent::Percent(s) => {
                let digits = s
                    .strip_suffix('%')
                    .ok_or_else(|| ReconcileError::InvalidIntOrPercent(s.clone()))?;
                let percent: i64 = digits
                    .trim()
                    .parse()
                    .map_err(|_| ReconcileError::InvalidIntOrPercent(s.clone()))?;
                let scaled = percent * i64::from(total);
                let value = if round_up {
                    (scaled + 99).div_euclid(100)
                } else {
                    scaled.div_euclid(100)
                };
                i32::try_from(value).map_err(|_| ReconcileError::InvalidIntOrPercent(s.clone()))
            }
        }
    }
}

/// Resolve an optional int-or-percent against `total`, falling back to
/// `default` when unset or invalid.
pub fn scaled_value_or(
    value: Option<&IntOrPercent>,
    total: i32,
    round_up: bool,
    default: i32,
) -> i32 {
    value
        .and_then(|v| v.scaled_value(total, round_up).ok())
        .unwrap_or(default)
}

/// Restrict `value` to `[min, max]`. When `max < min`, `min` wins.
pub fn clamp<T: Ord>(value: T, min: T, max: T) -> T {
    if value > max {
        if max < min {
            return min;
        }
        return max;
    }
    if value < min {
        return min;
    }
    value
}
