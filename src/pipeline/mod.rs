//! Pipeline coordinator.
//!
//! Runs one question through extraction, resolution, normalization, data
//! retrieval and result assembly:
//!
//! ```text
//! Received -> IntentExtracted -> GeographyResolving -> IndicatorResolving
//!   -> ScaleNormalized -> DataFetching -> ResultAssembled -> ContextRecorded -> Done
//! ```
//!
//! Any step may end in `Failed(reason)`. Low resolver confidence does not
//! fail the query; the best candidate is used and a warning is attached.
//! The caller owns the [`ConversationContext`] and passes it to every call.

mod result;

pub use result::{
    assemble_rows, row_value, AssembledRows, ResolutionResult, ResultRow, Warning, WarningKind,
};

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheKey, CacheManager, Cached};
use crate::census::{DataRow, GeometrySource, RegionAreas, StatisticsSource};
use crate::config::Config;
use crate::context::{ConversationContext, ConversationTurn, InferredContext};
use crate::error::{AppResult, ResolutionError};
use crate::geography::{GeographyDirectory, GeographyResolver, ResolvedGeography};
use crate::indicators::{
    DerivedRegistry, Disambiguator, IndicatorCatalog, IndicatorResolution, IndicatorResolver,
    LlmDisambiguator, SelectionMethod,
};
use crate::intent::{Intent, IntentExtractor};
use crate::llm::LanguageModel;
use crate::scale;

/// Position of a query in the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Received,
    IntentExtracted,
    GeographyResolving,
    IndicatorResolving,
    ScaleNormalized,
    DataFetching,
    ResultAssembled,
    ContextRecorded,
    Done,
    Failed(String),
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStage::Failed(reason) => write!(f, "failed: {}", reason),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Stage history of one query.
#[derive(Debug)]
struct StageTrail {
    query_id: String,
    stages: Vec<PipelineStage>,
}

impl StageTrail {
    fn new() -> Self {
        Self {
            query_id: Uuid::new_v4().to_string(),
            stages: Vec::new(),
        }
    }

    fn enter(&mut self, stage: PipelineStage) {
        debug!(query_id = %self.query_id, stage = %stage, "Pipeline stage");
        self.stages.push(stage);
    }
}

/// Data-source coordinates shared by every query.
#[derive(Debug, Clone)]
struct DataScope {
    year: u16,
    state: String,
    area_vintage: u16,
}

/// Sequences the resolvers and collaborators for one question at a time.
///
/// Holds no per-conversation state; one pipeline can serve many sessions.
pub struct QueryPipeline {
    extractor: IntentExtractor,
    geography: GeographyResolver,
    indicators: IndicatorResolver,
    statistics: Arc<dyn StatisticsSource>,
    geometry: Arc<dyn GeometrySource>,
    cache: Arc<CacheManager>,
    scope: DataScope,
    clarification_threshold: f64,
}

impl QueryPipeline {
    /// Build a pipeline with the Louisiana directory, the standard derived
    /// registry and model-backed disambiguation.
    pub fn new(
        model: Arc<dyn LanguageModel>,
        statistics: Arc<dyn StatisticsSource>,
        geometry: Arc<dyn GeometrySource>,
        cache: Arc<CacheManager>,
        config: &Config,
    ) -> Self {
        let disambiguator: Arc<dyn Disambiguator> = Arc::new(LlmDisambiguator::new(model.clone()));
        Self {
            extractor: IntentExtractor::new(model),
            geography: GeographyResolver::new(
                Arc::new(GeographyDirectory::louisiana()),
                config.resolution.geography_min_similarity,
            ),
            indicators: IndicatorResolver::new(
                Arc::new(DerivedRegistry::standard()),
                disambiguator,
                config.resolution.clone(),
            ),
            statistics,
            geometry,
            cache,
            scope: DataScope {
                year: config.census.year,
                state: config.census.state_fips.clone(),
                area_vintage: config.census.area_vintage,
            },
            clarification_threshold: config.resolution.clarification_threshold,
        }
    }

    /// Replace the geography resolver.
    pub fn with_geography(mut self, geography: GeographyResolver) -> Self {
        self.geography = geography;
        self
    }

    /// Replace the indicator resolver.
    pub fn with_indicators(mut self, indicators: IndicatorResolver) -> Self {
        self.indicators = indicators;
        self
    }

    pub fn indicators(&self) -> &IndicatorResolver {
        &self.indicators
    }

    /// Answer `query`, recording the turn in `context` either way.
    pub async fn process(
        &self,
        query: &str,
        context: &mut ConversationContext,
    ) -> AppResult<ResolutionResult> {
        let start = Instant::now();
        let mut trail = StageTrail::new();
        trail.enter(PipelineStage::Received);

        match self.run(query, context, &mut trail).await {
            Ok(mut result) => {
                context.record(ConversationTurn::success(
                    query,
                    result.selected_geography.clone(),
                    result.intent.measure_phrase.clone().unwrap_or_default(),
                    result.selected_indicator.indicator_id.clone(),
                    result.selected_indicator.confidence,
                    result.rows.len(),
                ));
                trail.enter(PipelineStage::ContextRecorded);
                trail.enter(PipelineStage::Done);
                result.stages = trail.stages;

                info!(
                    query_id = %result.query_id,
                    rows = result.rows.len(),
                    indicator = %result.selected_indicator.indicator_id,
                    confidence = result.aggregate_confidence,
                    warnings = result.warnings.len(),
                    latency_ms = start.elapsed().as_millis(),
                    "Query resolved"
                );
                Ok(result)
            }
            Err(e) => {
                trail.enter(PipelineStage::Failed(e.to_string()));
                context.record(ConversationTurn::failure(query));
                warn!(
                    query_id = %trail.query_id,
                    error = %e,
                    latency_ms = start.elapsed().as_millis(),
                    "Query failed"
                );
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        query: &str,
        context: &ConversationContext,
        trail: &mut StageTrail,
    ) -> AppResult<ResolutionResult> {
        let mut warnings = Vec::new();

        let follow_up = ConversationContext::is_follow_up(query);
        let summary = if follow_up { context.summary() } else { None };
        let mut intent = self.extractor.extract(query, summary.as_deref()).await?;
        trail.enter(PipelineStage::IntentExtracted);

        let inferred = if follow_up || intent.measure_phrase.is_none() {
            context.infer_missing(
                query,
                intent.measure_phrase.as_deref(),
                intent.geography_phrase.as_deref(),
            )
        } else {
            InferredContext::default()
        };

        trail.enter(PipelineStage::GeographyResolving);
        let geography = self.resolve_geography(query, &intent, &inferred, &mut warnings)?;

        trail.enter(PipelineStage::IndicatorResolving);
        let catalog = self.catalog(&mut warnings).await?;
        let resolution = self
            .resolve_indicator(&mut intent, &inferred, context, &catalog, &mut warnings)
            .await?;
        let selected = &resolution.selected;

        if let Some(reason) = &resolution.fallback_reason {
            warnings.push(Warning::new(
                WarningKind::DisambiguationFallback,
                format!(
                    "could not disambiguate '{}' ({}); using '{}'",
                    intent.measure_phrase.as_deref().unwrap_or_default(),
                    reason,
                    selected.label
                ),
            ));
        }
        if selected.confidence < self.clarification_threshold {
            warnings.push(Warning::new(
                WarningKind::LowConfidence,
                format!(
                    "indicator '{}' matched with confidence {:.2}",
                    selected.label, selected.confidence
                ),
            ));
        }
        if let Some(geo) = &geography {
            if geo.confidence < self.clarification_threshold {
                warnings.push(Warning::new(
                    WarningKind::LowConfidence,
                    format!(
                        "geography '{}' matched with confidence {:.2}",
                        geo.canonical_name, geo.confidence
                    ),
                ));
            }
        }

        for adjustment in scale::normalize(&mut intent, selected.scale) {
            warnings.push(Warning::new(WarningKind::ScaleAmbiguity, adjustment.describe()));
        }
        if intent.order_range_bounds() {
            debug!("Range bounds swapped after normalization");
        }
        intent.validate()?;
        trail.enter(PipelineStage::ScaleNormalized);

        trail.enter(PipelineStage::DataFetching);
        let regions: Vec<String> = geography
            .iter()
            .map(|g| g.region_code.clone())
            .collect();
        let data = self
            .data_rows(&regions, &selected.required_indicators(), &mut warnings)
            .await?;
        let areas = if selected.needs_area() {
            Some(self.region_areas(&mut warnings).await?)
        } else {
            None
        };

        let assembled = assemble_rows(&intent, selected, &data, areas.as_ref());
        if assembled.missing > 0 {
            warnings.push(Warning::new(
                WarningKind::MissingValues,
                format!(
                    "{} of {} tracts have no value for '{}'",
                    assembled.missing,
                    data.len(),
                    selected.label
                ),
            ));
        }
        trail.enter(PipelineStage::ResultAssembled);

        let aggregate_confidence = geography
            .as_ref()
            .map_or(1.0, |g| g.confidence)
            .min(selected.confidence);

        Ok(ResolutionResult {
            query_id: trail.query_id.clone(),
            query: query.to_string(),
            intent,
            rows: assembled.rows,
            selected_indicator: resolution.selected.clone(),
            selection_method: resolution.method,
            rationale: resolution.rationale.clone(),
            selected_geography: geography,
            aggregate_confidence,
            warnings,
            stages: Vec::new(),
        })
    }

    /// Pick the region, or `None` for statewide scope.
    fn resolve_geography(
        &self,
        query: &str,
        intent: &Intent,
        inferred: &InferredContext,
        warnings: &mut Vec<Warning>,
    ) -> AppResult<Option<ResolvedGeography>> {
        if let Some(text) = &inferred.replacement_text {
            let found = self.geography.find_in_text(text);
            match &found {
                Some(geo) => debug!(region = %geo.region_code, "Replacement geography"),
                None => warnings.push(Warning::new(
                    WarningKind::ContextInferred,
                    "the replaced place was dropped and no new place was named; using statewide scope",
                )),
            }
            return Ok(found);
        }

        if let Some(phrase) = &intent.geography_phrase {
            return Ok(Some(self.geography.resolve(phrase)?));
        }

        if let Some(previous) = &inferred.geography {
            warnings.push(Warning::new(
                WarningKind::ContextInferred,
                format!("geography '{}' carried over from the previous question", previous.canonical_name),
            ));
            return Ok(Some(previous.clone()));
        }

        let found = self.geography.find_in_text(query);
        if found.is_none() {
            debug!("No geography named, using statewide scope");
        }
        Ok(found)
    }

    /// Resolve the measure, carrying it over from context when omitted.
    async fn resolve_indicator(
        &self,
        intent: &mut Intent,
        inferred: &InferredContext,
        context: &ConversationContext,
        catalog: &IndicatorCatalog,
        warnings: &mut Vec<Warning>,
    ) -> AppResult<IndicatorResolution> {
        if let Some(phrase) = intent.measure_phrase.clone() {
            return Ok(self.indicators.resolve(&phrase, catalog).await?);
        }

        let Some(measure) = inferred.measure.clone() else {
            return Err(ResolutionError::InvalidIntent {
                field: "measure".to_string(),
                reason: "the question names no measure and there is no earlier one to reuse"
                    .to_string(),
            }
            .into());
        };
        intent.measure_phrase = Some(measure.clone());
        warnings.push(Warning::new(
            WarningKind::ContextInferred,
            format!("measure '{}' carried over from the previous question", measure),
        ));

        let carried = inferred
            .indicator_id
            .as_deref()
            .and_then(|id| self.indicators.lookup_by_id(id, catalog));
        match carried {
            Some(mut selected) => {
                if let Some(confidence) = context.last_successful().and_then(|t| t.indicator_confidence) {
                    selected.confidence = confidence;
                }
                Ok(IndicatorResolution {
                    rationale: format!("'{}' reused from the previous question", selected.label),
                    candidates: vec![selected.clone()],
                    selected,
                    method: SelectionMethod::Context,
                    fallback_reason: None,
                })
            }
            None => Ok(self.indicators.resolve(&measure, catalog).await?),
        }
    }

    async fn catalog(&self, warnings: &mut Vec<Warning>) -> AppResult<IndicatorCatalog> {
        let year = self.scope.year;
        let cached = self
            .cache
            .get_or_fetch(&CacheKey::catalog(year), || self.statistics.fetch_catalog(year))
            .await?;
        Ok(take_cached(cached, warnings))
    }

    async fn data_rows(
        &self,
        regions: &[String],
        indicators: &[String],
        warnings: &mut Vec<Warning>,
    ) -> AppResult<Vec<DataRow>> {
        let scope = &self.scope;
        let key = CacheKey::data_rows(
            scope.year,
            scope.state.clone(),
            regions.iter().cloned(),
            indicators.iter().cloned(),
        );
        let cached = self
            .cache
            .get_or_fetch(&key, || {
                self.statistics
                    .fetch_rows(scope.year, &scope.state, regions, indicators)
            })
            .await?;
        Ok(take_cached(cached, warnings))
    }

    async fn region_areas(&self, warnings: &mut Vec<Warning>) -> AppResult<RegionAreas> {
        let scope = &self.scope;
        let key = CacheKey::region_areas(scope.area_vintage, scope.state.clone());
        let cached = self
            .cache
            .get_or_fetch(&key, || {
                self.geometry
                    .fetch_region_areas(scope.area_vintage, &scope.state)
            })
            .await?;
        Ok(take_cached(cached, warnings))
    }
}

fn take_cached<T>(cached: Cached<T>, warnings: &mut Vec<Warning>) -> T {
    warnings.extend(
        cached
            .warnings
            .into_iter()
            .map(|message| Warning::new(WarningKind::CacheRecovered, message)),
    );
    cached.value
}
