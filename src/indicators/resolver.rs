use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::catalog::{Indicator, IndicatorCatalog, Scale};
use super::derived::{DerivedIndicator, DerivedRegistry, Formula, DERIVED_PREFIX};
use crate::config::ResolutionConfig;
use crate::error::{LlmError, LlmResult, ResolutionError, ResolveResult, ScoredCandidate};
use crate::llm::{extract_json_from_completion, ChatMessage, LanguageModel};
use crate::prompts::DISAMBIGUATION_PROMPT;

/// Common measure phrasings mapped to catalog wording.
const MEASURE_SYNONYMS: &[(&str, &str)] = &[
    ("median income", "median household income"),
    ("income", "median household income"),
    ("household income", "median household income"),
    ("rent", "median gross rent"),
    ("median rent", "median gross rent"),
    ("home value", "median value owner occupied housing units"),
    ("median home value", "median value owner occupied housing units"),
    ("age", "median age"),
    ("population", "total population"),
];

/// Qualifiers that mark a subgroup-specific variable.
const DEMOGRAPHIC_KEYWORDS: &[&str] = &[
    "white alone",
    "black alone",
    "african american alone",
    "asian alone",
    "hispanic",
    "latino",
    "native hawaiian",
    "pacific islander",
    "american indian",
    "alaska native",
    "two or more races",
    "nonveteran",
    "veteran",
    "food stamps",
    "snap",
    "foreign born",
    "native born",
    "citizen",
    "noncitizen",
    "renter occupied",
    "owner occupied",
    "with a mortgage",
    "without a mortgage",
    "male householder",
    "female householder",
    "nonfamily household",
];

const DEMOGRAPHIC_PENALTY: f64 = 15.0;
const MAIN_ESTIMATE_BONUS: f64 = 5.0;
const LABEL_WEIGHT: f64 = 0.7;
const CONCEPT_WEIGHT: f64 = 0.3;
const MAX_SUGGESTIONS: usize = 3;

/// Map a measure phrase through the synonym table.
pub fn normalize_measure(phrase: &str) -> String {
    let lowered = phrase.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    MEASURE_SYNONYMS
        .iter()
        .find(|(from, _)| *from == lowered)
        .map(|(_, to)| to.to_string())
        .unwrap_or(lowered)
}

fn tokens(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn join_parts(head: &str, tail: &str) -> String {
    match (head.is_empty(), tail.is_empty()) {
        (true, _) => tail.to_string(),
        (_, true) => head.to_string(),
        _ => format!("{} {}", head, tail),
    }
}

/// Token-set similarity on a 0-100 scale.
///
/// Compares the sorted shared tokens against each side's full sorted token
/// list, so a phrase whose tokens all appear in the other text scores 100.
pub fn token_set_ratio(a: &str, b: &str) -> f64 {
    let left = tokens(a);
    let right = tokens(b);
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }

    let join = |set: Vec<&String>| {
        set.into_iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    };
    let common = join(left.intersection(&right).collect());
    let with_left = join_parts(&common, &join(left.difference(&right).collect()));
    let with_right = join_parts(&common, &join(right.difference(&left).collect()));

    let ratio = |x: &str, y: &str| strsim::normalized_levenshtein(x, y) * 100.0;
    let mut best = ratio(&with_left, &with_right);
    if !common.is_empty() {
        best = best
            .max(ratio(&common, &with_left))
            .max(ratio(&common, &with_right));
    }
    best
}

fn has_demographic_qualifier(text: &str) -> bool {
    let lowered = text.to_lowercase();
    DEMOGRAPHIC_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Preference for profile, subject, then detailed tables.
fn table_penalty(table: &str) -> f64 {
    if table.starts_with("DP") {
        0.0
    } else if table.starts_with('S') {
        0.5
    } else if table.starts_with('B') {
        1.0
    } else {
        2.0
    }
}

/// Adjusted 0-100 score of a base indicator for a normalized phrase.
pub fn score_indicator(phrase: &str, indicator: &Indicator) -> f64 {
    let label_score = token_set_ratio(phrase, &indicator.label);
    let concept_score = token_set_ratio(phrase, &indicator.concept);
    let mut score = label_score * LABEL_WEIGHT + concept_score * CONCEPT_WEIGHT;

    if has_demographic_qualifier(&indicator.label) || has_demographic_qualifier(&indicator.concept)
    {
        score -= DEMOGRAPHIC_PENALTY;
    }
    if indicator.is_main_estimate() {
        score += MAIN_ESTIMATE_BONUS;
    }
    score - table_penalty(&indicator.table)
}

fn score_derived(phrase: &str, derived: &DerivedIndicator) -> f64 {
    if derived.is_named(phrase) {
        return 100.0;
    }
    std::iter::once(derived.name.as_str())
        .chain(std::iter::once(derived.label.as_str()))
        .chain(derived.synonyms.iter().map(String::as_str))
        .map(|text| token_set_ratio(phrase, text))
        .fold(0.0, f64::max)
}

/// A possible resolution of a measure phrase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorCandidate {
    pub indicator_id: String,
    pub label: String,
    pub description: String,
    pub is_derived: bool,
    /// Present for derived indicators only.
    pub formula: Option<Formula>,
    pub scale: Scale,
    /// Adjusted similarity on the 0-100 scale.
    pub fuzzy_score: f64,
    pub confidence: f64,
}

impl IndicatorCandidate {
    fn from_base(indicator: &Indicator, fuzzy_score: f64) -> Self {
        Self {
            indicator_id: indicator.id.clone(),
            label: indicator.label.clone(),
            description: indicator.description.clone(),
            is_derived: false,
            formula: None,
            scale: indicator.scale,
            fuzzy_score,
            confidence: score_to_confidence(fuzzy_score),
        }
    }

    fn from_derived(derived: &DerivedIndicator, fuzzy_score: f64) -> Self {
        Self {
            indicator_id: derived.id(),
            label: derived.label.clone(),
            description: derived.description.clone(),
            is_derived: true,
            formula: Some(derived.formula.clone()),
            scale: derived.scale,
            fuzzy_score,
            confidence: score_to_confidence(fuzzy_score),
        }
    }

    /// Base indicator ids that must be fetched to produce this value.
    pub fn required_indicators(&self) -> Vec<String> {
        match &self.formula {
            Some(formula) => formula
                .base_indicators()
                .into_iter()
                .map(str::to_string)
                .collect(),
            None => vec![self.indicator_id.clone()],
        }
    }

    pub fn needs_area(&self) -> bool {
        self.formula.as_ref().is_some_and(Formula::needs_area)
    }

    fn as_scored(&self) -> ScoredCandidate {
        ScoredCandidate {
            name: self.label.clone(),
            id: self.indicator_id.clone(),
            score: self.confidence,
        }
    }
}

fn score_to_confidence(score: f64) -> f64 {
    (score / 100.0).clamp(0.0, 1.0)
}

fn by_score(a: &IndicatorCandidate, b: &IndicatorCandidate) -> Ordering {
    b.fuzzy_score
        .total_cmp(&a.fuzzy_score)
        .then_with(|| a.indicator_id.cmp(&b.indicator_id))
}

/// How the final indicator was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMethod {
    /// Exact derived-indicator name or synonym.
    Exact,
    /// Top candidate led by more than the dominance margin.
    Dominant,
    /// The language model picked among the top candidates.
    Disambiguated,
    /// Disambiguation failed; the top candidate was kept.
    Fallback,
    /// Carried over from an earlier turn.
    Context,
}

/// Outcome of resolving a measure phrase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorResolution {
    pub selected: IndicatorCandidate,
    pub candidates: Vec<IndicatorCandidate>,
    pub method: SelectionMethod,
    pub rationale: String,
    /// Why disambiguation fell back, when it did.
    pub fallback_reason: Option<String>,
}

/// Model choice among the top candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub indicator_id: String,
    #[serde(default)]
    pub rationale: String,
}

/// Picks one indicator out of the top candidates.
#[async_trait]
pub trait Disambiguator: Send + Sync {
    async fn choose(&self, phrase: &str, candidates: &[IndicatorCandidate]) -> LlmResult<Choice>;
}

/// [`Disambiguator`] backed by the language model.
pub struct LlmDisambiguator {
    model: Arc<dyn LanguageModel>,
}

impl LlmDisambiguator {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Disambiguator for LlmDisambiguator {
    async fn choose(&self, phrase: &str, candidates: &[IndicatorCandidate]) -> LlmResult<Choice> {
        let listing: Vec<String> = candidates
            .iter()
            .map(|c| format!("- {}: {} ({})", c.indicator_id, c.label, c.description))
            .collect();
        let user = format!(
            "User request: \"{}\"\n\nCandidate indicators:\n{}",
            phrase,
            listing.join("\n")
        );

        let completion = self
            .model
            .complete(
                vec![ChatMessage::system(DISAMBIGUATION_PROMPT), ChatMessage::user(user)],
                true,
            )
            .await?;

        let json = extract_json_from_completion(&completion)
            .map_err(|message| LlmError::InvalidResponse { message })?;
        serde_json::from_str(json).map_err(|e| LlmError::InvalidResponse {
            message: format!("disambiguation choice: {}", e),
        })
    }
}

/// Resolves measure phrases to base or derived indicators.
#[derive(Clone)]
pub struct IndicatorResolver {
    derived: Arc<DerivedRegistry>,
    disambiguator: Arc<dyn Disambiguator>,
    config: ResolutionConfig,
}

impl IndicatorResolver {
    pub fn new(
        derived: Arc<DerivedRegistry>,
        disambiguator: Arc<dyn Disambiguator>,
        config: ResolutionConfig,
    ) -> Self {
        Self {
            derived,
            disambiguator,
            config,
        }
    }

    pub fn derived(&self) -> &DerivedRegistry {
        &self.derived
    }

    /// Score both families and return the best `limit`, highest first.
    pub fn rank(&self, phrase: &str, catalog: &IndicatorCatalog, limit: usize) -> Vec<IndicatorCandidate> {
        let normalized = normalize_measure(phrase);
        let phrase_tokens = tokens(&normalized);

        let mut candidates: Vec<IndicatorCandidate> = self
            .derived
            .iter()
            .map(|d| IndicatorCandidate::from_derived(d, score_derived(&normalized, d)))
            .collect();

        // Only indicators sharing a token are scored unless none do.
        let shares_token = |ind: &&Indicator| {
            let text = tokens(&format!("{} {}", ind.label, ind.concept));
            !phrase_tokens.is_disjoint(&text)
        };
        let mut base: Vec<&Indicator> = catalog.iter().filter(shares_token).collect();
        if base.is_empty() {
            base = catalog.iter().collect();
        }
        candidates.extend(
            base.into_iter()
                .map(|ind| IndicatorCandidate::from_base(ind, score_indicator(&normalized, ind))),
        );

        candidates.sort_by(by_score);
        candidates.truncate(limit);
        candidates
    }

    /// Top-K candidates per the configured `top_k`.
    pub fn candidates(&self, phrase: &str, catalog: &IndicatorCatalog) -> Vec<IndicatorCandidate> {
        self.rank(phrase, catalog, self.config.top_k)
    }

    /// Resolve a measure phrase to one indicator.
    pub async fn resolve(
        &self,
        phrase: &str,
        catalog: &IndicatorCatalog,
    ) -> ResolveResult<IndicatorResolution> {
        let normalized = normalize_measure(phrase);

        if let Some(derived) = self.derived.find_named(&normalized) {
            let selected = IndicatorCandidate::from_derived(derived, 100.0);
            debug!(phrase = %phrase, indicator = %selected.indicator_id, "Exact derived indicator");
            return Ok(IndicatorResolution {
                candidates: vec![selected.clone()],
                rationale: format!("'{}' names the derived indicator '{}'", phrase, derived.name),
                selected,
                method: SelectionMethod::Exact,
                fallback_reason: None,
            });
        }

        let candidates = self.candidates(phrase, catalog);
        let Some(best) = candidates.first().cloned() else {
            return Err(ResolutionError::IndicatorNotFound {
                phrase: phrase.to_string(),
                candidates: Vec::new(),
            });
        };

        if best.confidence < self.config.indicator_min_similarity {
            return Err(ResolutionError::IndicatorNotFound {
                phrase: phrase.to_string(),
                candidates: candidates
                    .iter()
                    .take(MAX_SUGGESTIONS)
                    .map(IndicatorCandidate::as_scored)
                    .collect(),
            });
        }

        let lead = candidates
            .get(1)
            .map(|runner_up| best.fuzzy_score - runner_up.fuzzy_score);
        match lead {
            None => {
                return Ok(self.deterministic(phrase, best, candidates, "only candidate"));
            }
            Some(lead) if lead > self.config.dominance_margin => {
                let reason = format!("leads runner-up by {:.1} points", lead);
                return Ok(self.deterministic(phrase, best, candidates, &reason));
            }
            Some(_) => {}
        }

        debug!(phrase = %phrase, candidates = candidates.len(), "Escalating to disambiguation");

        let outcome = self
            .disambiguator
            .choose(phrase, &candidates)
            .await
            .map_err(|e| e.to_string())
            .and_then(|choice| {
                candidates
                    .iter()
                    .find(|c| c.indicator_id == choice.indicator_id)
                    .cloned()
                    .map(|chosen| (chosen, choice.rationale.clone()))
                    .ok_or_else(|| {
                        format!("model chose '{}', which is not a candidate", choice.indicator_id)
                    })
            });

        let resolution = match outcome {
            Ok((mut chosen, rationale)) => {
                chosen.confidence = self.penalized(chosen.confidence);
                info!(
                    phrase = %phrase,
                    indicator = %chosen.indicator_id,
                    confidence = chosen.confidence,
                    "Indicator disambiguated"
                );
                IndicatorResolution {
                    selected: chosen,
                    candidates,
                    method: SelectionMethod::Disambiguated,
                    rationale,
                    fallback_reason: None,
                }
            }
            Err(reason) => {
                warn!(phrase = %phrase, reason = %reason, "Disambiguation failed, keeping top candidate");
                let mut selected = best;
                selected.confidence = self.penalized(selected.confidence);
                IndicatorResolution {
                    rationale: format!("highest similarity score ({:.1})", selected.fuzzy_score),
                    selected,
                    candidates,
                    method: SelectionMethod::Fallback,
                    fallback_reason: Some(reason),
                }
            }
        };
        Ok(resolution)
    }

    fn deterministic(
        &self,
        phrase: &str,
        best: IndicatorCandidate,
        candidates: Vec<IndicatorCandidate>,
        reason: &str,
    ) -> IndicatorResolution {
        debug!(phrase = %phrase, indicator = %best.indicator_id, reason = %reason, "Indicator selected");
        IndicatorResolution {
            rationale: format!("'{}' scored {:.1}, {}", best.label, best.fuzzy_score, reason),
            selected: best,
            candidates,
            method: SelectionMethod::Dominant,
            fallback_reason: None,
        }
    }

    fn penalized(&self, confidence: f64) -> f64 {
        (confidence - self.config.disambiguation_penalty).max(0.0)
    }

    /// Rebuild a candidate from its id, e.g. to carry a measure forward.
    pub fn lookup_by_id(&self, id: &str, catalog: &IndicatorCatalog) -> Option<IndicatorCandidate> {
        if id.starts_with(DERIVED_PREFIX) {
            self.derived
                .get(id)
                .map(|d| IndicatorCandidate::from_derived(d, 100.0))
        } else {
            catalog
                .get(id)
                .map(|ind| IndicatorCandidate::from_base(ind, 100.0))
        }
    }
}
