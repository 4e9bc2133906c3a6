use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Data source error: {0}")]
    DataSource(#[from] DataSourceError),

    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Cache storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Corrupt cache entry {key}: {message}")]
    Corrupt { key: String, message: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// LLM inference errors
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM unavailable: {message} (retries: {retries})")]
    Unavailable { message: String, retries: u32 },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Statistical-data and geometry retrieval errors
#[derive(Debug, Error)]
pub enum DataSourceError {
    #[error("Data source unavailable: {message} (retries: {retries})")]
    Unavailable { message: String, retries: u32 },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Throttled by data source (retry after {retry_after_ms}ms)")]
    Throttled { retry_after_ms: u64 },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// A scored alternative attached to not-found errors so callers can ask
/// the user to pick one.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ScoredCandidate {
    /// Display name of the candidate.
    pub name: String,
    /// Identifier (region code or indicator id).
    pub id: String,
    /// Similarity score in [0, 1].
    pub score: f64,
}

/// Query resolution errors
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("Could not parse model output after {attempts} attempt(s): {message}")]
    Parse { message: String, attempts: u32 },

    #[error("Geography not found for '{phrase}'{}", format_candidates(.candidates))]
    GeographyNotFound {
        phrase: String,
        candidates: Vec<ScoredCandidate>,
    },

    #[error("Indicator not found for '{phrase}'{}", format_candidates(.candidates))]
    IndicatorNotFound {
        phrase: String,
        candidates: Vec<ScoredCandidate>,
    },

    #[error("Invalid intent: {field} - {reason}")]
    InvalidIntent { field: String, reason: String },
}

fn format_candidates(candidates: &[ScoredCandidate]) -> String {
    if candidates.is_empty() {
        return String::new();
    }
    let listed: Vec<String> = candidates
        .iter()
        .map(|c| format!("{} ({:.2})", c.name, c.score))
        .collect();
    format!(" (closest: {})", listed.join(", "))
}

impl LlmError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Timeout { .. } | LlmError::Http(_) | LlmError::Unavailable { .. } => true,
            LlmError::Api { status, .. } => *status == 429 || *status >= 500,
            LlmError::InvalidResponse { .. } => false,
        }
    }
}

impl DataSourceError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            DataSourceError::Timeout { .. }
            | DataSourceError::Http(_)
            | DataSourceError::Throttled { .. }
            | DataSourceError::Unavailable { .. } => true,
            DataSourceError::Api { status, .. } => *status == 429 || *status >= 500,
            DataSourceError::InvalidResponse { .. } => false,
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Query {
            message: format!("payload serialization failed: {}", err),
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for cache storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for LLM operations
pub type LlmResult<T> = Result<T, LlmError>;

/// Result type alias for data source operations
pub type DataSourceResult<T> = Result<T, DataSourceError>;

/// Result type alias for resolution steps
pub type ResolveResult<T> = Result<T, ResolutionError>;
