use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::census::{DataRow, RegionAreas};
use crate::geography::ResolvedGeography;
use crate::indicators::{IndicatorCandidate, SelectionMethod};
use crate::intent::{Comparison, Intent, Task};

use super::PipelineStage;

/// Category of a non-fatal issue attached to a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// A resolver confidence fell below the clarification threshold.
    LowConfidence,
    /// A threshold was rescaled from a fraction to percentage points.
    ScaleAmbiguity,
    /// A cache entry was unreadable or could not be written.
    CacheRecovered,
    /// The language model could not pick among close indicators.
    DisambiguationFallback,
    /// A field was carried over from an earlier turn.
    ContextInferred,
    /// Some rows had no value for the selected indicator.
    MissingValues,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

impl Warning {
    pub fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// One tract in the answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub geoid: String,
    pub tract_name: String,
    pub region_name: Option<String>,
    pub value: f64,
}

/// Complete answer to one question, with provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionResult {
    /// Random id, also attached to this query's log lines.
    pub query_id: String,
    pub query: String,
    /// Intent after inference and scale normalization.
    pub intent: Intent,
    pub rows: Vec<ResultRow>,
    pub selected_indicator: IndicatorCandidate,
    pub selection_method: SelectionMethod,
    pub rationale: String,
    /// `None` means statewide.
    pub selected_geography: Option<ResolvedGeography>,
    /// Weakest component confidence.
    pub aggregate_confidence: f64,
    pub warnings: Vec<Warning>,
    pub stages: Vec<PipelineStage>,
}

impl ResolutionResult {
    pub fn has_warning(&self, kind: WarningKind) -> bool {
        self.warnings.iter().any(|w| w.kind == kind)
    }
}

/// Rows that survived plus how many had no value.
#[derive(Debug, Clone, Default)]
pub struct AssembledRows {
    pub rows: Vec<ResultRow>,
    pub missing: usize,
}

/// Value of `indicator` for `row`, computing derived formulas on the spot.
pub fn row_value(row: &DataRow, indicator: &IndicatorCandidate, areas: Option<&RegionAreas>) -> Option<f64> {
    match &indicator.formula {
        Some(formula) => {
            let area = areas.and_then(|a| a.get(&row.geoid)).copied();
            formula.evaluate(|id| row.value(id), area)
        }
        None => row.value(&indicator.indicator_id),
    }
}

fn keeps(intent: &Intent, value: f64) -> bool {
    match intent.task {
        Task::RankTop | Task::RankBottom => true,
        Task::FilterThreshold => match intent.comparison_value {
            Some(threshold) => intent
                .comparison
                .unwrap_or(Comparison::Ge)
                .holds(value, threshold),
            None => true,
        },
        Task::FilterRange => {
            intent.range_low.map_or(true, |low| value >= low)
                && intent.range_high.map_or(true, |high| value <= high)
        }
    }
}

/// Compute values, filter, order and truncate per the intent.
pub fn assemble_rows(
    intent: &Intent,
    indicator: &IndicatorCandidate,
    data: &[DataRow],
    areas: Option<&RegionAreas>,
) -> AssembledRows {
    let mut missing = 0;
    let mut rows: Vec<ResultRow> = data
        .iter()
        .filter_map(|row| match row_value(row, indicator, areas) {
            Some(value) => Some((row, value)),
            None => {
                missing += 1;
                None
            }
        })
        .filter(|(_, value)| keeps(intent, *value))
        .map(|(row, value)| {
            let (tract_name, region_name) = row.name_parts();
            ResultRow {
                geoid: row.geoid.clone(),
                tract_name,
                region_name,
                value,
            }
        })
        .collect();

    let descending = intent.task.sorts_descending();
    rows.sort_by(|a, b| {
        let by_value = if descending {
            b.value.total_cmp(&a.value)
        } else {
            a.value.total_cmp(&b.value)
        };
        match by_value {
            Ordering::Equal => a.geoid.cmp(&b.geoid),
            other => other,
        }
    });

    if let Some(limit) = intent.limit {
        rows.truncate(limit);
    }

    AssembledRows { rows, missing }
}
