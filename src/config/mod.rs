use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub llm: LlmConfig,
    pub census: CensusConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub request: RequestConfig,
    pub resolution: ResolutionConfig,
    pub cache: CacheConfig,
    pub context: ContextConfig,
}

/// Ollama inference endpoint configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    pub temperature: f64,
}

/// Census data and geometry endpoints
#[derive(Debug, Clone)]
pub struct CensusConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// ACS 5-year release year
    pub year: u16,
    /// Two-digit state code all queries are scoped to
    pub state_fips: String,
    pub gazetteer_base_url: String,
    /// Gazetteer vintage used for land areas
    pub area_vintage: u16,
}

/// Database configuration for the persistent cache
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// HTTP request configuration shared by all external calls
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

/// Thresholds that govern geography and indicator resolution
#[derive(Debug, Clone)]
pub struct ResolutionConfig {
    /// Minimum normalized similarity for a fuzzy geography match
    pub geography_min_similarity: f64,
    /// Minimum normalized score for an indicator candidate
    pub indicator_min_similarity: f64,
    /// Score points (0-100) the best candidate must lead by to skip disambiguation
    pub dominance_margin: f64,
    /// Number of indicator candidates generated per phrase
    pub top_k: usize,
    /// Confidence reduction applied when disambiguation was needed
    pub disambiguation_penalty: f64,
    /// Below this confidence the result carries a low-confidence warning
    pub clarification_threshold: f64,
}

/// Cache freshness configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub catalog_ttl_days: i64,
}

/// Conversation context configuration
#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub max_turns: usize,
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn check_unit_interval(name: &str, value: f64) -> Result<(), AppError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(AppError::Config {
            message: format!("{} must be within [0, 1], got {}", name, value),
        })
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let llm = LlmConfig {
            endpoint: env::var("OLLAMA_ENDPOINT")
                .unwrap_or_else(|_| "http://localhost:11434".to_string()),
            model: env::var("OLLAMA_MODEL").unwrap_or_else(|_| "phi3:mini".to_string()),
            temperature: parse_env("LLM_TEMPERATURE", 0.1),
        };

        let census = CensusConfig {
            base_url: env::var("CENSUS_BASE_URL")
                .unwrap_or_else(|_| "https://api.census.gov".to_string()),
            api_key: env::var("CENSUS_KEY").ok().filter(|k| !k.trim().is_empty()),
            year: parse_env("ACS_YEAR", 2023),
            state_fips: env::var("STATE_FIPS").unwrap_or_else(|_| "22".to_string()),
            gazetteer_base_url: env::var("GAZETTEER_BASE_URL")
                .unwrap_or_else(|_| "https://www2.census.gov".to_string()),
            area_vintage: parse_env("AREA_VINTAGE", 2024),
        };

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("CACHE_DATABASE_PATH").unwrap_or_else(|_| "./data/cache.db".to_string()),
            ),
            max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 5),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let defaults = RequestConfig::default();
        let request = RequestConfig {
            timeout_ms: parse_env("REQUEST_TIMEOUT_MS", defaults.timeout_ms),
            max_retries: parse_env("MAX_RETRIES", defaults.max_retries),
            retry_delay_ms: parse_env("RETRY_DELAY_MS", defaults.retry_delay_ms),
        };

        let defaults = ResolutionConfig::default();
        let resolution = ResolutionConfig {
            geography_min_similarity: parse_env(
                "GEOGRAPHY_MIN_SIMILARITY",
                defaults.geography_min_similarity,
            ),
            indicator_min_similarity: parse_env(
                "INDICATOR_MIN_SIMILARITY",
                defaults.indicator_min_similarity,
            ),
            dominance_margin: parse_env("DOMINANCE_MARGIN", defaults.dominance_margin),
            top_k: parse_env("CANDIDATE_TOP_K", defaults.top_k),
            disambiguation_penalty: parse_env(
                "DISAMBIGUATION_PENALTY",
                defaults.disambiguation_penalty,
            ),
            clarification_threshold: parse_env(
                "CLARIFICATION_THRESHOLD",
                defaults.clarification_threshold,
            ),
        };
        resolution.validate()?;

        let cache = CacheConfig {
            catalog_ttl_days: parse_env("CATALOG_TTL_DAYS", CacheConfig::default().catalog_ttl_days),
        };

        let context = ContextConfig {
            max_turns: parse_env("CONTEXT_MAX_TURNS", ContextConfig::default().max_turns),
        };
        if context.max_turns == 0 {
            return Err(AppError::Config {
                message: "CONTEXT_MAX_TURNS must be at least 1".to_string(),
            });
        }

        Ok(Config {
            llm,
            census,
            database,
            logging,
            request,
            resolution,
            cache,
            context,
        })
    }
}

impl ResolutionConfig {
    /// Check that every threshold is in range
    pub fn validate(&self) -> Result<(), AppError> {
        check_unit_interval("GEOGRAPHY_MIN_SIMILARITY", self.geography_min_similarity)?;
        check_unit_interval("INDICATOR_MIN_SIMILARITY", self.indicator_min_similarity)?;
        check_unit_interval("DISAMBIGUATION_PENALTY", self.disambiguation_penalty)?;
        check_unit_interval("CLARIFICATION_THRESHOLD", self.clarification_threshold)?;
        if self.top_k == 0 {
            return Err(AppError::Config {
                message: "CANDIDATE_TOP_K must be at least 1".to_string(),
            });
        }
        if self.dominance_margin < 0.0 {
            return Err(AppError::Config {
                message: format!(
                    "DOMINANCE_MARGIN must not be negative, got {}",
                    self.dominance_margin
                ),
            });
        }
        Ok(())
    }
}

impl Default for CensusConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.census.gov".to_string(),
            api_key: None,
            year: 2023,
            state_fips: "22".to_string(),
            gazetteer_base_url: "https://www2.census.gov".to_string(),
            area_vintage: 2024,
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60000,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            geography_min_similarity: 0.5,
            indicator_min_similarity: 0.5,
            dominance_margin: 10.0,
            top_k: 5,
            disambiguation_penalty: 0.15,
            clarification_threshold: 0.6,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            catalog_ttl_days: 14,
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self { max_turns: 10 }
    }
}
