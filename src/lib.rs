//! # Census Query Resolver
//!
//! Turns natural-language questions about Louisiana census tracts into
//! resolved, filtered and ranked results from the ACS 5-year estimates.
//!
//! ## Features
//!
//! - **Intent extraction**: an Ollama-served model parses the question into a
//!   validated [`intent::Intent`], retried once with a stricter prompt
//! - **Geography resolution**: parishes, aliases and cities, exact or fuzzy
//! - **Indicator resolution**: fuzzy catalog search with derived metrics such as
//!   poverty rate and population density, disambiguated by the model when close
//! - **Scale normalization**: fractions promoted to percentage points
//! - **Conversation context**: follow-up questions inherit omitted fields
//! - **Caching**: catalog, data rows and tract areas in SQLite, with per-key
//!   fetch coalescing
//!
//! ## Architecture
//!
//! ```text
//! question → IntentExtractor (Ollama) → GeographyResolver + IndicatorResolver
//!          → scale::normalize → CacheManager ⇄ Census ACS / Gazetteer
//!          → ResolutionResult → ConversationContext
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use census_query_resolver::cache::{CacheManager, CachePolicy, SqliteCacheStore};
//! use census_query_resolver::census::{CensusClient, GazetteerClient};
//! use census_query_resolver::context::ConversationContext;
//! use census_query_resolver::llm::OllamaClient;
//! use census_query_resolver::{Config, QueryPipeline};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let store = SqliteCacheStore::new(&config.database).await?;
//!     let cache = Arc::new(CacheManager::new(Arc::new(store), CachePolicy::from_config(&config.cache)));
//!     let model = Arc::new(OllamaClient::new(&config.llm, config.request.clone())?);
//!     let census = Arc::new(CensusClient::new(&config.census, config.request.clone())?);
//!     let gazetteer = Arc::new(GazetteerClient::new(&config.census, config.request.clone())?);
//!     let pipeline = QueryPipeline::new(model, census, gazetteer, cache, &config);
//!
//!     let mut context = ConversationContext::new(config.context.max_turns);
//!     let result = pipeline.process("top 5 tracts by median income in Orleans", &mut context).await?;
//!     println!("{}", serde_json::to_string_pretty(&result)?);
//!     Ok(())
//! }
//! ```

/// Cache keys, stores and the read-through cache manager.
pub mod cache;
/// ACS data and Gazetteer area collaborators.
pub mod census;
/// Configuration management.
pub mod config;
/// Per-session conversation history and follow-up inference.
pub mod context;
/// Indicator discovery flow.
pub mod discovery;
/// Error types and result aliases for the application.
pub mod error;
/// Parish directory and geography resolution.
pub mod geography;
/// Indicator catalog, derived metrics and indicator resolution.
pub mod indicators;
/// Intent model, parsing and extraction.
pub mod intent;
/// Ollama client and the language-model seam.
pub mod llm;
/// Query pipeline coordinator and result types.
pub mod pipeline;
/// System prompts for the language model.
pub mod prompts;
/// Shared retry policy for external calls.
pub mod retry;
/// Fraction-to-percentage normalization of thresholds.
pub mod scale;

pub use config::Config;
pub use context::{ConversationContext, SessionContexts};
pub use error::{AppError, AppResult};
pub use pipeline::{QueryPipeline, ResolutionResult};
