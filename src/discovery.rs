//! Indicator discovery: "what variables exist for ..." questions.
//!
//! Runs on its own [`ConversationContext`], separate from the query flow, so
//! browsing the catalog never changes what a query follow-up inherits.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cache::{CacheKey, CacheManager};
use crate::census::StatisticsSource;
use crate::context::{ConversationContext, ConversationTurn};
use crate::error::{AppResult, ResolutionError};
use crate::indicators::{IndicatorCandidate, IndicatorResolver};

/// Matches returned per question.
pub const DEFAULT_MATCHES: usize = 10;

/// Question openers stripped before scoring, longest first.
const QUESTION_PREFIXES: &[&str] = &[
    "what variables are available for",
    "what variables are there for",
    "what variables exist for",
    "what variables exist about",
    "what indicators exist for",
    "what data is there on",
    "what data do you have on",
    "what data do you have about",
    "do you have data on",
    "show me variables about",
    "show me variables for",
    "find variables about",
    "find variables for",
    "what about",
    "how about",
    "and for",
    "also",
    "now",
];

/// Words that ask for more of the same rather than name a topic.
const CONTINUATION_WORDS: &[&str] = &["and", "more", "else", "other", "others", "ones", "what", "any"];

/// Topic plus the indicators that match it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryAnswer {
    pub topic: String,
    /// True when the topic came from the previous discovery question.
    pub reused_topic: bool,
    pub matches: Vec<IndicatorCandidate>,
}

/// Browses the indicator catalog by topic.
pub struct CatalogExplorer {
    indicators: IndicatorResolver,
    statistics: Arc<dyn StatisticsSource>,
    cache: Arc<CacheManager>,
    year: u16,
    limit: usize,
}

/// Reduce a question to its topic words.
pub fn extract_topic(question: &str) -> String {
    let mut text = question
        .trim()
        .trim_end_matches(['?', '.', '!'])
        .to_lowercase();
    if let Some(prefix) = QUESTION_PREFIXES.iter().find(|p| {
        text.starts_with(*p)
            && text[p.len()..]
                .chars()
                .next()
                .map_or(true, |c| !c.is_alphanumeric())
    }) {
        text = text[prefix.len()..].to_string();
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl CatalogExplorer {
    pub fn new(
        indicators: IndicatorResolver,
        statistics: Arc<dyn StatisticsSource>,
        cache: Arc<CacheManager>,
        year: u16,
    ) -> Self {
        Self {
            indicators,
            statistics,
            cache,
            year,
            limit: DEFAULT_MATCHES,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    /// Answer a discovery question and record it in `context`.
    ///
    /// A question that names no topic of its own ("what else?", "and more")
    /// reuses the previous topic.
    pub async fn ask(
        &self,
        question: &str,
        context: &mut ConversationContext,
    ) -> AppResult<DiscoveryAnswer> {
        let mut topic = extract_topic(question);
        let mut reused_topic = false;
        let names_no_topic = topic
            .split_whitespace()
            .all(|w| CONTINUATION_WORDS.contains(&w));
        if names_no_topic {
            match context.last_successful().and_then(|t| t.resolved_measure.clone()) {
                Some(previous) => {
                    debug!(topic = %previous, "Reusing previous discovery topic");
                    topic = previous;
                    reused_topic = true;
                }
                None => {
                    context.record(ConversationTurn::failure(question));
                    return Err(ResolutionError::InvalidIntent {
                        field: "topic".to_string(),
                        reason: "the question names no topic to search for".to_string(),
                    }
                    .into());
                }
            }
        }

        let year = self.year;
        let catalog = self
            .cache
            .get_or_fetch(&CacheKey::catalog(year), || self.statistics.fetch_catalog(year))
            .await;
        let catalog = match catalog {
            Ok(cached) => cached.value,
            Err(e) => {
                context.record(ConversationTurn::failure(question));
                return Err(e.into());
            }
        };

        let matches = self.indicators.rank(&topic, &catalog, self.limit);
        let best = matches.first().map(|m| (m.indicator_id.clone(), m.confidence));
        match best {
            Some((id, confidence)) => context.record(ConversationTurn::success(
                question,
                None,
                topic.clone(),
                id,
                confidence,
                matches.len(),
            )),
            None => context.record(ConversationTurn::failure(question)),
        }

        info!(topic = %topic, matches = matches.len(), "Discovery answered");
        Ok(DiscoveryAnswer {
            topic,
            reused_topic,
            matches,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_topic_strips_openers() {
        assert_eq!(extract_topic("What variables exist for housing?"), "housing");
        assert_eq!(extract_topic("what about  commute time"), "commute time");
        assert_eq!(extract_topic("median rent"), "median rent");
        assert_eq!(extract_topic("nowhere"), "nowhere");
        assert_eq!(extract_topic("what about?"), "");
    }

    #[test]
    fn test_continuation_words_name_no_topic() {
        let topic = extract_topic("and more?");
        assert!(topic.split_whitespace().all(|w| CONTINUATION_WORDS.contains(&w)));
    }
}
