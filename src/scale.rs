//! Scale normalization of intent thresholds.
//!
//! Questions often state percentages as fractions ("0.4") while percentage
//! indicators hold percentage points (40). Values below 1 are promoted for
//! percentage indicators. A genuine sub-1% threshold ("0.5%") cannot be told
//! apart from a fraction, so every promotion is reported.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::indicators::Scale;
use crate::intent::Intent;

/// A threshold that was rescaled from a fraction to percentage points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleAdjustment {
    /// `value`, `range_low` or `range_high`.
    pub field: String,
    pub original: f64,
    pub adjusted: f64,
}

impl ScaleAdjustment {
    /// Human-readable explanation for result warnings.
    pub fn describe(&self) -> String {
        format!(
            "{} {} was read as a fraction and rescaled to {} percentage points; \
             a threshold meant as {}% cannot be expressed",
            self.field, self.original, self.adjusted, self.original
        )
    }
}

fn promote(field: &str, slot: &mut Option<f64>, adjustments: &mut Vec<ScaleAdjustment>) {
    if let Some(value) = *slot {
        if value.abs() < 1.0 && value != 0.0 {
            let adjusted = value * 100.0;
            *slot = Some(adjusted);
            adjustments.push(ScaleAdjustment {
                field: field.to_string(),
                original: value,
                adjusted,
            });
        }
    }
}

/// Rescale the intent's thresholds in place for an indicator of `scale`.
///
/// Raw-scale indicators pass through. Values of 1 or more are never
/// touched, so normalizing twice is a no-op.
pub fn normalize(intent: &mut Intent, scale: Scale) -> Vec<ScaleAdjustment> {
    let mut adjustments = Vec::new();
    if scale != Scale::Percentage {
        return adjustments;
    }

    promote("value", &mut intent.comparison_value, &mut adjustments);
    promote("range_low", &mut intent.range_low, &mut adjustments);
    promote("range_high", &mut intent.range_high, &mut adjustments);

    for adjustment in &adjustments {
        debug!(
            field = %adjustment.field,
            original = adjustment.original,
            adjusted = adjustment.adjusted,
            "Promoted fraction to percentage points"
        );
    }
    adjustments
}
