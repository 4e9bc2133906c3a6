//! Conversation context: bounded history of resolved turns used to fill in
//! what follow-up questions leave out.
//!
//! A [`ConversationContext`] is owned by one session and passed explicitly
//! into each pipeline call. The query flow and the discovery flow each hold
//! their own instance (see [`SessionContexts`]).

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StorageError;
use crate::geography::ResolvedGeography;

/// Default number of turns kept.
pub const DEFAULT_MAX_TURNS: usize = 10;

/// Number of turns rendered by [`ConversationContext::summary`].
const SUMMARY_TURNS: usize = 3;

/// Phrases that mark a continuation of the previous question.
const FOLLOW_UP_MARKERS: &[&str] = &[
    "now",
    "also",
    "what about",
    "instead of",
    "same for",
    "how about",
    "and for",
    "what if",
];

/// Words that may precede a marker without hiding it ("ok now ...").
const LEADING_FILLERS: &[&str] = &["ok", "okay", "and", "so", "then", "but", "alright"];

/// One recorded question and what it resolved to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub query_text: String,
    pub resolved_geography: Option<ResolvedGeography>,
    /// Measure phrase as resolved (after inference).
    pub resolved_measure: Option<String>,
    pub resolved_indicator_id: Option<String>,
    pub indicator_confidence: Option<f64>,
    pub result_row_count: usize,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    /// A successful turn.
    pub fn success(
        query_text: impl Into<String>,
        geography: Option<ResolvedGeography>,
        measure: impl Into<String>,
        indicator_id: impl Into<String>,
        indicator_confidence: f64,
        result_row_count: usize,
    ) -> Self {
        Self {
            query_text: query_text.into(),
            resolved_geography: geography,
            resolved_measure: Some(measure.into()),
            resolved_indicator_id: Some(indicator_id.into()),
            indicator_confidence: Some(indicator_confidence),
            result_row_count,
            success: true,
            timestamp: Utc::now(),
        }
    }

    /// A failed turn; inference never reads it.
    pub fn failure(query_text: impl Into<String>) -> Self {
        Self {
            query_text: query_text.into(),
            resolved_geography: None,
            resolved_measure: None,
            resolved_indicator_id: None,
            indicator_confidence: None,
            result_row_count: 0,
            success: false,
            timestamp: Utc::now(),
        }
    }
}

/// Values carried over from the last successful turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferredContext {
    pub geography: Option<ResolvedGeography>,
    pub measure: Option<String>,
    pub indicator_id: Option<String>,
    /// For "X instead of <previous place>": the text before "instead of",
    /// to be searched for the new place when the extraction did not name it
    /// or named the replaced one.
    pub replacement_text: Option<String>,
}

impl InferredContext {
    pub fn is_empty(&self) -> bool {
        self.geography.is_none() && self.measure.is_none()
    }
}

/// Ring buffer of recent turns for one conversational surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationContext {
    max_turns: usize,
    turns: VecDeque<ConversationTurn>,
}

impl Default for ConversationContext {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TURNS)
    }
}

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

fn contains_phrase(words: &[String], phrase: &str) -> Option<usize> {
    let target: Vec<&str> = phrase.split(' ').collect();
    words
        .windows(target.len())
        .position(|w| w.iter().zip(&target).all(|(a, b)| a == b))
}

fn mentions(text_words: &[String], value: &str) -> bool {
    let value_words = words(value);
    if value_words.is_empty() {
        return false;
    }
    contains_phrase(text_words, &value_words.join(" ")).is_some()
}

impl ConversationContext {
    /// Create a store keeping at most `max_turns` turns (at least one).
    pub fn new(max_turns: usize) -> Self {
        let max_turns = max_turns.max(1);
        Self {
            max_turns,
            turns: VecDeque::with_capacity(max_turns),
        }
    }

    /// Append a turn, evicting the oldest when full.
    pub fn record(&mut self, turn: ConversationTurn) {
        if self.turns.len() == self.max_turns {
            self.turns.pop_front();
        }
        debug!(success = turn.success, turns = self.turns.len() + 1, "Recorded turn");
        self.turns.push_back(turn);
    }

    /// Whether `text` starts with a continuation marker.
    ///
    /// The marker must be a whole word or phrase at the start, optionally
    /// after one filler word such as "ok" or "and".
    pub fn is_follow_up(text: &str) -> bool {
        let words = words(text);
        let starts_with = |slice: &[String]| {
            FOLLOW_UP_MARKERS
                .iter()
                .any(|marker| contains_phrase(slice, marker) == Some(0))
        };
        let after_filler = match words.first() {
            Some(first) if LEADING_FILLERS.contains(&first.as_str()) => starts_with(&words[1..]),
            _ => false,
        };

        starts_with(&words[..]) || after_filler || contains_phrase(&words, "instead of").is_some()
    }

    /// Most recent successful turn.
    pub fn last_successful(&self) -> Option<&ConversationTurn> {
        self.turns.iter().rev().find(|t| t.success)
    }

    /// Fill in what the current question omitted from the last successful turn.
    ///
    /// `measure` and `geography_phrase` are what the current extraction found.
    /// A missing field is carried over, except for the field an
    /// "X instead of Y" question replaces: Y matching the previous place
    /// swaps the place and keeps the measure, Y matching the previous
    /// measure swaps the measure and keeps the place.
    pub fn infer_missing(
        &self,
        text: &str,
        measure: Option<&str>,
        geography_phrase: Option<&str>,
    ) -> InferredContext {
        let Some(previous) = self.last_successful() else {
            return InferredContext::default();
        };
        let text_words = words(text);

        let previous_measure = previous.resolved_measure.as_deref().unwrap_or_default();
        let previous_place = previous
            .resolved_geography
            .as_ref()
            .map(|g| g.canonical_name.trim_end_matches(" Parish"))
            .unwrap_or_default();

        let swap = contains_phrase(&text_words, "instead of")
            .map(|at| (&text_words[..at], &text_words[at + 2..]));
        let swaps_place = swap.is_some_and(|(_, replaced)| mentions(replaced, previous_place));
        let swaps_measure = swap.is_some_and(|(_, replaced)| mentions(replaced, previous_measure));

        let mut inferred = InferredContext::default();
        if measure.is_none() && !swaps_measure {
            inferred.measure = previous.resolved_measure.clone();
            inferred.indicator_id = previous.resolved_indicator_id.clone();
        }
        if geography_phrase.is_none() && !swaps_place {
            inferred.geography = previous.resolved_geography.clone();
        }

        if let Some((head, replaced)) = swap.filter(|_| swaps_place) {
            let named_replaced = geography_phrase
                .map(|g| mentions(replaced, g) && !mentions(head, g))
                .unwrap_or(true);
            if named_replaced {
                inferred.replacement_text = Some(head.join(" "));
            }
        }

        if !inferred.is_empty() || inferred.replacement_text.is_some() {
            debug!(
                measure = ?inferred.measure,
                geography = ?inferred.geography.as_ref().map(|g| &g.region_code),
                replacement = ?inferred.replacement_text,
                "Inferred context from previous turn"
            );
        }
        inferred
    }

    /// Render the last few turns for the extraction prompt.
    pub fn summary(&self) -> Option<String> {
        let recent: Vec<&ConversationTurn> = self
            .turns
            .iter()
            .rev()
            .filter(|t| t.success)
            .take(SUMMARY_TURNS)
            .collect();
        if recent.is_empty() {
            return None;
        }

        let mut lines = vec!["Previous questions in this conversation:".to_string()];
        for turn in recent.into_iter().rev() {
            lines.push(format!(
                "- \"{}\" -> measure: {}, geography: {}, rows: {}",
                turn.query_text,
                turn.resolved_measure.as_deref().unwrap_or("unknown"),
                turn.resolved_geography
                    .as_ref()
                    .map(|g| g.canonical_name.as_str())
                    .unwrap_or("statewide"),
                turn.result_row_count
            ));
        }
        Some(lines.join("\n"))
    }

    /// Turns, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// Export the history as JSON.
    pub fn to_json(&self) -> Result<String, StorageError> {
        Ok(serde_json::to_string_pretty(&self.turns)?)
    }
}

/// The two independent context stores of one session.
#[derive(Debug, Clone, Default)]
pub struct SessionContexts {
    /// Main query flow.
    pub query: ConversationContext,
    /// Indicator discovery/help flow.
    pub discovery: ConversationContext,
}

impl SessionContexts {
    pub fn new(max_turns: usize) -> Self {
        Self {
            query: ConversationContext::new(max_turns),
            discovery: ConversationContext::new(max_turns),
        }
    }
}
