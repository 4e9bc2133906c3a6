use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::directory::{normalize_place, EntryKind, GeographyDirectory, COMMON_WORD_NAMES};
use crate::error::{ResolutionError, ResolveResult, ScoredCandidate};

/// How a geography phrase was matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    Exact,
    Alias,
    Fuzzy,
}

/// Outcome of resolving a place phrase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedGeography {
    pub canonical_name: String,
    pub region_code: String,
    /// 1.0 for exact and alias matches, the similarity for fuzzy ones.
    pub confidence: f64,
    pub match_source: MatchSource,
}

/// Whether the user meant a city or a parish when a name is both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceHint {
    Parish,
    City,
}

/// Maps free-text place phrases to directory regions.
#[derive(Debug, Clone)]
pub struct GeographyResolver {
    directory: Arc<GeographyDirectory>,
    min_similarity: f64,
}

const MAX_SUGGESTIONS: usize = 3;
const MAX_NGRAM: usize = 4;

impl GeographyResolver {
    pub fn new(directory: Arc<GeographyDirectory>, min_similarity: f64) -> Self {
        Self {
            directory,
            min_similarity,
        }
    }

    pub fn directory(&self) -> &GeographyDirectory {
        &self.directory
    }

    /// Resolve a place phrase.
    ///
    /// Tries, in order: exact text, normalized text, then fuzzy similarity
    /// against every key. Fails with the closest candidates when nothing
    /// clears the similarity floor.
    pub fn resolve(&self, phrase: &str) -> ResolveResult<ResolvedGeography> {
        let raw = collapse_whitespace(&phrase.to_lowercase());
        if raw.is_empty() {
            return Err(ResolutionError::GeographyNotFound {
                phrase: phrase.to_string(),
                candidates: Vec::new(),
            });
        }
        let hint = detect_hint(&raw);

        if let Some(found) = self.lookup(&raw, hint, |e| e.raw.as_str()) {
            debug!(phrase = %phrase, code = %found.region_code, "Exact geography match");
            return Ok(found);
        }

        let normalized = normalize_place(&raw);
        if let Some(found) = self.lookup(&normalized, hint, |e| e.normalized.as_str()) {
            debug!(phrase = %phrase, code = %found.region_code, "Normalized geography match");
            return Ok(found);
        }

        let ranked = self.rank_fuzzy(&normalized);
        match ranked.first() {
            Some(best) if best.score >= self.min_similarity => {
                debug!(
                    phrase = %phrase,
                    code = %best.id,
                    score = best.score,
                    "Fuzzy geography match"
                );
                Ok(ResolvedGeography {
                    canonical_name: best.name.clone(),
                    region_code: best.id.clone(),
                    confidence: best.score,
                    match_source: MatchSource::Fuzzy,
                })
            }
            _ => Err(ResolutionError::GeographyNotFound {
                phrase: phrase.to_string(),
                candidates: ranked.into_iter().take(MAX_SUGGESTIONS).collect(),
            }),
        }
    }

    /// Resolve a region by its code, e.g. when restoring context.
    pub fn resolve_code(&self, code: &str) -> Option<ResolvedGeography> {
        self.directory.region(code).map(|region| ResolvedGeography {
            canonical_name: region.canonical_name(),
            region_code: region.code.clone(),
            confidence: 1.0,
            match_source: MatchSource::Exact,
        })
    }

    /// Scan free text for the first directory name, longest span first.
    ///
    /// Only exact or normalized matches count. Names that double as common
    /// words are accepted only when the next token is "parish".
    pub fn find_in_text(&self, text: &str) -> Option<ResolvedGeography> {
        let tokens: Vec<String> = text
            .split_whitespace()
            .map(|t| {
                t.trim_matches(|c: char| !c.is_alphanumeric() && c != '.')
                    .trim_end_matches('.')
                    .to_lowercase()
            })
            .filter(|t| !t.is_empty())
            .collect();

        for start in 0..tokens.len() {
            let longest = MAX_NGRAM.min(tokens.len() - start);
            for len in (1..=longest).rev() {
                let span = tokens[start..start + len].join(" ");
                let next = tokens.get(start + len).map(String::as_str);

                if len == 1 && COMMON_WORD_NAMES.contains(&span.as_str()) && next != Some("parish") {
                    continue;
                }

                let hint = match next {
                    Some("parish") => Some(PlaceHint::Parish),
                    Some("city") => Some(PlaceHint::City),
                    _ => None,
                };
                let normalized = normalize_place(&span);
                if normalized.is_empty() {
                    continue;
                }
                if let Some(found) = self.lookup(&normalized, hint, |e| e.normalized.as_str()) {
                    debug!(span = %span, code = %found.region_code, "Geography found in text");
                    return Some(found);
                }
            }
        }
        None
    }

    fn lookup<F>(&self, key: &str, hint: Option<PlaceHint>, field: F) -> Option<ResolvedGeography>
    where
        F: Fn(&super::directory::DirectoryEntry) -> &str,
    {
        let matches: Vec<_> = self
            .directory
            .entries()
            .iter()
            .filter(|e| field(e) == key)
            .collect();

        let preferred = match hint {
            Some(PlaceHint::City) => matches
                .iter()
                .find(|e| e.kind == EntryKind::City)
                .or_else(|| matches.first()),
            _ => matches
                .iter()
                .find(|e| e.kind == EntryKind::Canonical)
                .or_else(|| matches.iter().find(|e| e.kind == EntryKind::Alias))
                .or_else(|| matches.first()),
        }?;

        let region = self.directory.region(&preferred.code)?;
        Some(ResolvedGeography {
            canonical_name: region.canonical_name(),
            region_code: region.code.clone(),
            confidence: 1.0,
            match_source: match preferred.kind {
                EntryKind::Canonical => MatchSource::Exact,
                EntryKind::Alias | EntryKind::City => MatchSource::Alias,
            },
        })
    }

    /// Best fuzzy score per region, descending.
    fn rank_fuzzy(&self, normalized: &str) -> Vec<ScoredCandidate> {
        let mut best: HashMap<&str, f64> = HashMap::new();
        for entry in self.directory.entries() {
            let score = strsim::normalized_levenshtein(normalized, &entry.normalized);
            let slot = best.entry(entry.code.as_str()).or_insert(0.0);
            if score > *slot {
                *slot = score;
            }
        }

        let mut ranked: Vec<ScoredCandidate> = best
            .into_iter()
            .filter_map(|(code, score)| {
                self.directory.region(code).map(|region| ScoredCandidate {
                    name: region.canonical_name(),
                    id: region.code.clone(),
                    score,
                })
            })
            .collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        ranked
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn detect_hint(raw: &str) -> Option<PlaceHint> {
    let last = raw
        .rsplit(|c: char| c.is_whitespace() || c == ',')
        .find(|t| !t.is_empty())?;
    match last {
        "parish" => Some(PlaceHint::Parish),
        "city" => Some(PlaceHint::City),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> GeographyResolver {
        GeographyResolver::new(Arc::new(GeographyDirectory::louisiana()), 0.5)
    }

    #[test]
    fn test_exact_parish_name() {
        let found = resolver().resolve("Orleans Parish").unwrap();
        assert_eq!(found.region_code, "071");
        assert_eq!(found.canonical_name, "Orleans Parish");
        assert_eq!(found.confidence, 1.0);
        assert_eq!(found.match_source, MatchSource::Exact);
    }

    #[test]
    fn test_city_alias() {
        let found = resolver().resolve("New Orleans").unwrap();
        assert_eq!(found.region_code, "071");
        assert_eq!(found.match_source, MatchSource::Alias);

        let found = resolver().resolve("baton rouge").unwrap();
        assert_eq!(found.region_code, "033");
        assert_eq!(found.canonical_name, "East Baton Rouge Parish");
    }

    #[test]
    fn test_saint_abbreviations() {
        for phrase in ["St. Tammany", "st tammany parish", "Saint Tammany"] {
            let found = resolver().resolve(phrase).unwrap();
            assert_eq!(found.region_code, "103", "{}", phrase);
            assert_eq!(found.confidence, 1.0);
        }
    }

    #[test]
    fn test_hint_prefers_city_or_parish() {
        let parish = resolver().resolve("Franklin Parish").unwrap();
        assert_eq!(parish.region_code, "041");

        let city = resolver().resolve("Franklin city").unwrap();
        assert_eq!(city.region_code, "101");

        let bare = resolver().resolve("Franklin").unwrap();
        assert_eq!(bare.region_code, "041");
    }

    #[test]
    fn test_fuzzy_match_misspelling() {
        let found = resolver().resolve("Tangipahoe").unwrap();
        assert_eq!(found.region_code, "105");
        assert_eq!(found.match_source, MatchSource::Fuzzy);
        assert!(found.confidence < 1.0 && found.confidence >= 0.5);
    }

    #[test]
    fn test_not_found_lists_candidates() {
        let err = resolver().resolve("Qqqqqq").unwrap_err();
        match err {
            ResolutionError::GeographyNotFound { phrase, candidates } => {
                assert_eq!(phrase, "Qqqqqq");
                assert!(candidates.len() <= 3);
                assert!(candidates.windows(2).all(|w| w[0].score >= w[1].score));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_empty_phrase_is_not_found() {
        assert!(matches!(
            resolver().resolve("   "),
            Err(ResolutionError::GeographyNotFound { .. })
        ));
    }

    #[test]
    fn test_find_in_text_prefers_longest_span() {
        let found = resolver()
            .find_in_text("top 5 tracts by income in East Baton Rouge")
            .unwrap();
        assert_eq!(found.region_code, "033");
    }

    #[test]
    fn test_find_in_text_skips_common_words() {
        let r = resolver();
        assert!(r.find_in_text("tracts with union membership over 10").is_none());

        let found = r.find_in_text("income in Union Parish").unwrap();
        assert_eq!(found.region_code, "111");
    }

    #[test]
    fn test_find_in_text_handles_punctuation() {
        let found = resolver()
            .find_in_text("What's the poverty rate in Caddo?")
            .unwrap();
        assert_eq!(found.region_code, "017");
    }

    #[test]
    fn test_resolve_code() {
        let found = resolver().resolve_code("017").unwrap();
        assert_eq!(found.canonical_name, "Caddo Parish");
        assert!(resolver().resolve_code("999").is_none());
    }
}
