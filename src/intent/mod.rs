//! Query intent: the typed shape of a question, and its extraction from
//! model output.
//!
//! Model output is validated against a tagged schema right at the boundary.
//! A completion that does not conform gets exactly one retry with a stricter
//! prompt before the extraction fails with [`ResolutionError::Parse`].

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AppResult, ResolutionError, ResolveResult};
use crate::llm::{extract_json_from_completion, ChatMessage, LanguageModel};
use crate::prompts::{intent_user_message, INTENT_EXTRACTION_PROMPT, STRICT_RETRY_PROMPT};

/// Limit used for rank questions that do not say how many rows they want.
pub const DEFAULT_LIMIT: usize = 10;

/// What the question asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    RankTop,
    RankBottom,
    FilterThreshold,
    FilterRange,
}

impl Task {
    /// Whether the task orders and truncates rows.
    pub fn is_rank(&self) -> bool {
        matches!(self, Task::RankTop | Task::RankBottom)
    }

    /// Result ordering: highest first for top and threshold filters.
    pub fn sorts_descending(&self) -> bool {
        matches!(self, Task::RankTop | Task::FilterThreshold)
    }
}

/// Comparison operator for threshold filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "=")]
    Eq,
}

impl Comparison {
    /// Parse an operator symbol; `==` is accepted as `=`.
    pub fn parse(op: &str) -> Option<Self> {
        match op.trim() {
            ">" => Some(Comparison::Gt),
            ">=" | "=>" => Some(Comparison::Ge),
            "<" => Some(Comparison::Lt),
            "<=" | "=<" => Some(Comparison::Le),
            "=" | "==" => Some(Comparison::Eq),
            _ => None,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Eq => "=",
        }
    }

    /// Whether `value <op> threshold` holds.
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Gt => value > threshold,
            Comparison::Ge => value >= threshold,
            Comparison::Lt => value < threshold,
            Comparison::Le => value <= threshold,
            Comparison::Eq => (value - threshold).abs() < f64::EPSILON,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Structured form of a question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub task: Task,
    pub measure_phrase: Option<String>,
    pub geography_phrase: Option<String>,
    /// Operator for threshold filters; `>=` when the question gave none.
    pub comparison: Option<Comparison>,
    pub comparison_value: Option<f64>,
    pub range_low: Option<f64>,
    pub range_high: Option<f64>,
    pub limit: Option<usize>,
}

impl Intent {
    /// A rank question over `measure`.
    pub fn rank(task: Task, measure: impl Into<String>, limit: usize) -> Self {
        Self {
            task,
            measure_phrase: Some(measure.into()),
            geography_phrase: None,
            comparison: None,
            comparison_value: None,
            range_low: None,
            range_high: None,
            limit: Some(limit),
        }
    }

    /// A threshold filter over `measure`.
    pub fn threshold(measure: impl Into<String>, comparison: Comparison, value: f64) -> Self {
        Self {
            task: Task::FilterThreshold,
            measure_phrase: Some(measure.into()),
            geography_phrase: None,
            comparison: Some(comparison),
            comparison_value: Some(value),
            range_low: None,
            range_high: None,
            limit: None,
        }
    }

    /// An inclusive range filter over `measure`.
    pub fn range(measure: impl Into<String>, low: f64, high: f64) -> Self {
        Self {
            task: Task::FilterRange,
            measure_phrase: Some(measure.into()),
            geography_phrase: None,
            comparison: None,
            comparison_value: None,
            range_low: Some(low),
            range_high: Some(high),
            limit: None,
        }
    }

    pub fn with_geography(mut self, phrase: impl Into<String>) -> Self {
        self.geography_phrase = Some(phrase.into());
        self
    }

    /// Put range bounds in ascending order. Returns true when they were swapped.
    ///
    /// Run after scale normalization: a bound given as a fraction only
    /// compares correctly once it has been promoted.
    pub fn order_range_bounds(&mut self) -> bool {
        match (self.range_low, self.range_high) {
            (Some(low), Some(high)) if low > high => {
                std::mem::swap(&mut self.range_low, &mut self.range_high);
                true
            }
            _ => false,
        }
    }

    /// Check the task-specific field invariants, including bound order.
    pub fn validate(&self) -> ResolveResult<()> {
        self.check_fields()?;
        match (self.range_low, self.range_high) {
            (Some(low), Some(high)) if low > high => Err(invalid(
                "range",
                &format!("lower bound {} exceeds upper bound {}", low, high),
            )),
            _ => Ok(()),
        }
    }

    fn check_fields(&self) -> ResolveResult<()> {
        match self.task {
            Task::RankTop | Task::RankBottom => match self.limit {
                Some(0) | None => Err(invalid("limit", "rank tasks need a positive limit")),
                Some(_) => Ok(()),
            },
            Task::FilterThreshold => {
                if self.comparison_value.is_none() {
                    return Err(invalid("value", "threshold filters need a comparison value"));
                }
                if self.range_low.is_some() || self.range_high.is_some() {
                    return Err(invalid("range", "threshold filters must not carry range bounds"));
                }
                Ok(())
            }
            Task::FilterRange => {
                if self.range_low.is_none() || self.range_high.is_none() {
                    return Err(invalid("range", "range filters need both bounds"));
                }
                if self.comparison_value.is_some() {
                    return Err(invalid("value", "range filters must not carry a threshold"));
                }
                Ok(())
            }
        }
    }
}

fn invalid(field: &str, reason: &str) -> ResolutionError {
    ResolutionError::InvalidIntent {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// A number as the model may emit it: a JSON number or text like `"35k"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Quantity {
    Number(f64),
    Text(String),
}

impl Quantity {
    fn value(&self) -> Option<f64> {
        match self {
            Quantity::Number(n) => Some(*n),
            Quantity::Text(s) => parse_quantity(s),
        }
    }
}

/// Model output schema, tagged on `task`.
#[derive(Debug, Deserialize)]
#[serde(tag = "task", rename_all = "lowercase")]
enum RawIntent {
    Top {
        measure: Option<String>,
        geography: Option<String>,
        limit: Option<Quantity>,
    },
    Bottom {
        measure: Option<String>,
        geography: Option<String>,
        limit: Option<Quantity>,
    },
    Filter {
        measure: Option<String>,
        geography: Option<String>,
        op: Option<String>,
        value: Option<Quantity>,
    },
    Range {
        measure: Option<String>,
        geography: Option<String>,
        range_min: Option<Quantity>,
        range_max: Option<Quantity>,
    },
}

fn non_empty(text: Option<String>) -> Option<String> {
    text.map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("null"))
}

fn quantity(field: &str, q: Option<Quantity>) -> ResolveResult<Option<f64>> {
    match q {
        None => Ok(None),
        Some(q) => q
            .value()
            .map(Some)
            .ok_or_else(|| invalid(field, &format!("not a number: {:?}", q))),
    }
}

fn rank_intent(
    task: Task,
    measure: Option<String>,
    geography: Option<String>,
    limit: Option<Quantity>,
) -> ResolveResult<Intent> {
    let limit = match quantity("limit", limit)? {
        None => DEFAULT_LIMIT,
        Some(n) if n >= 1.0 => n.round() as usize,
        Some(n) => {
            return Err(invalid(
                "limit",
                &format!("expected a positive count, got {}", n),
            ))
        }
    };

    Ok(Intent {
        task,
        measure_phrase: non_empty(measure),
        geography_phrase: non_empty(geography),
        comparison: None,
        comparison_value: None,
        range_low: None,
        range_high: None,
        limit: Some(limit),
    })
}

impl RawIntent {
    fn into_intent(self) -> ResolveResult<Intent> {
        let intent = match self {
            RawIntent::Top {
                measure,
                geography,
                limit,
            } => rank_intent(Task::RankTop, measure, geography, limit)?,
            RawIntent::Bottom {
                measure,
                geography,
                limit,
            } => rank_intent(Task::RankBottom, measure, geography, limit)?,
            RawIntent::Filter {
                measure,
                geography,
                op,
                value,
            } => {
                let comparison = match op.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                    None => Comparison::Ge,
                    Some(symbol) => Comparison::parse(symbol).ok_or_else(|| {
                        invalid("op", &format!("unknown operator '{}'", symbol))
                    })?,
                };
                Intent {
                    task: Task::FilterThreshold,
                    measure_phrase: non_empty(measure),
                    geography_phrase: non_empty(geography),
                    comparison: Some(comparison),
                    comparison_value: quantity("value", value)?,
                    range_low: None,
                    range_high: None,
                    limit: None,
                }
            }
            RawIntent::Range {
                measure,
                geography,
                range_min,
                range_max,
            } => {
                let low = quantity("range_min", range_min)?;
                let high = quantity("range_max", range_max)?;
                Intent {
                    task: Task::FilterRange,
                    measure_phrase: non_empty(measure),
                    geography_phrase: non_empty(geography),
                    comparison: None,
                    comparison_value: None,
                    range_low: low,
                    range_high: high,
                    limit: None,
                }
            }
        };

        // Bound order is settled after scale normalization
        intent.check_fields()?;
        Ok(intent)
    }
}

fn word_number(word: &str) -> Option<f64> {
    let n = match word {
        "one" => 1.0,
        "two" => 2.0,
        "three" => 3.0,
        "four" => 4.0,
        "five" => 5.0,
        "six" => 6.0,
        "seven" => 7.0,
        "eight" => 8.0,
        "nine" => 9.0,
        "ten" => 10.0,
        "fifteen" => 15.0,
        "twenty" => 20.0,
        "thirty" => 30.0,
        "fifty" => 50.0,
        "hundred" => 100.0,
        _ => return None,
    };
    Some(n)
}

/// Parse a quantity written as text.
///
/// Handles thousands separators, currency signs, word numbers, `k`/`m`
/// (and `thousand`/`million`) multipliers, and percent suffixes. A percent
/// yields a fraction: `"20%"` parses to `0.2`.
pub fn parse_quantity(text: &str) -> Option<f64> {
    let cleaned = text
        .trim()
        .to_lowercase()
        .replace(|c: char| c == ',' || c == '$', "");
    let mut body = cleaned.trim();
    let mut multiplier = 1.0;
    let mut divisor = 1.0;

    if let Some(rest) = ["percent", "pct", "%"]
        .iter()
        .find_map(|suffix| body.strip_suffix(*suffix))
    {
        body = rest.trim();
        divisor = 100.0;
    } else {
        for (suffix, factor) in [
            ("thousand", 1_000.0),
            ("million", 1_000_000.0),
            ("k", 1_000.0),
            ("m", 1_000_000.0),
        ] {
            if let Some(rest) = body.strip_suffix(suffix) {
                body = rest.trim();
                multiplier = factor;
                break;
            }
        }
    }

    let base = body.parse::<f64>().ok().or_else(|| word_number(body))?;
    base.is_finite().then(|| base * multiplier / divisor)
}

/// Parse one completion into a validated intent.
pub fn parse_intent(completion: &str) -> ResolveResult<Intent> {
    let json = extract_json_from_completion(completion).map_err(|message| {
        ResolutionError::Parse {
            message,
            attempts: 1,
        }
    })?;
    let raw: RawIntent = serde_json::from_str(json).map_err(|e| ResolutionError::Parse {
        message: format!("schema violation: {}", e),
        attempts: 1,
    })?;
    raw.into_intent()
}

/// Turns questions into validated intents with the language model.
#[derive(Clone)]
pub struct IntentExtractor {
    model: Arc<dyn LanguageModel>,
}

impl IntentExtractor {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// Extract the intent of `question`.
    ///
    /// `context_summary` carries prior turns for follow-up questions. A
    /// non-conforming completion is retried once with a stricter prompt.
    pub async fn extract(&self, question: &str, context_summary: Option<&str>) -> AppResult<Intent> {
        let mut messages = vec![
            ChatMessage::system(INTENT_EXTRACTION_PROMPT),
            ChatMessage::user(intent_user_message(question, context_summary)),
        ];

        let completion = self.model.complete(messages.clone(), true).await?;
        let first_error = match parse_intent(&completion) {
            Ok(intent) => {
                debug!(task = ?intent.task, measure = ?intent.measure_phrase, "Intent extracted");
                return Ok(intent);
            }
            Err(e) => e,
        };

        warn!(error = %first_error, "Intent output rejected, retrying with strict prompt");
        messages.push(ChatMessage::assistant(completion));
        messages.push(ChatMessage::user(format!(
            "{}\n\nProblem with your previous answer: {}",
            STRICT_RETRY_PROMPT, first_error
        )));

        let completion = self.model.complete(messages, true).await?;
        match parse_intent(&completion) {
            Ok(intent) => {
                debug!(task = ?intent.task, "Intent extracted on strict retry");
                Ok(intent)
            }
            Err(e) => Err(ResolutionError::Parse {
                message: e.to_string(),
                attempts: 2,
            }
            .into()),
        }
    }
}
