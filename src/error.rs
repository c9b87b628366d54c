use thiserror::Error;

/// Custom error type for Fabula operations.
#[derive(Debug, Error)]
pub enum FabulaError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Requested entity was not found.
    #[error("Not found: {entity_type} with id '{id}'")]
    NotFound { entity_type: String, id: String },

    /// Input validation failed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Conflict detected (e.g., a second analysis task for the same novel).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The LLM did not answer within the configured timeout.
    #[error("LLM timeout: {0}")]
    LlmTimeout(String),

    /// The LLM endpoint could not be reached or returned a non-success status.
    #[error("LLM unavailable: {0}")]
    LlmUnavailable(String),

    /// The LLM returned text that could not be decoded as JSON, even after repair.
    #[error("JSON parse error: {0}")]
    JsonParse(String),

    /// The decoded document does not have the expected top-level shape.
    #[error("Schema invalid: {0}")]
    SchemaInvalid(String),

    /// Prompt assembly exceeded the model's context budget.
    #[error("Context budget exceeded: {0}")]
    BudgetExceeded(String),

    /// World-structure agent failed; the structure reverts to its last snapshot.
    #[error("World agent error: {0}")]
    Agent(String),

    /// Layout optimizer exceeded its time budget or failed to converge.
    #[error("Solver error: {0}")]
    Solver(String),

    /// Embedding client failed or is disabled.
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Configuration is missing or malformed.
    #[error("Config error: {0}")]
    Config(String),
}

impl FabulaError {
    /// True for the extraction failure kinds that mark a chapter `failed`
    /// without aborting the surrounding task.
    pub fn is_chapter_failure(&self) -> bool {
        matches!(
            self,
            FabulaError::LlmTimeout(_)
                | FabulaError::LlmUnavailable(_)
                | FabulaError::JsonParse(_)
                | FabulaError::SchemaInvalid(_)
                | FabulaError::BudgetExceeded(_)
        )
    }
}

impl From<sqlx::Error> for FabulaError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => FabulaError::NotFound {
                entity_type: "row".to_string(),
                id: String::new(),
            },
            other => FabulaError::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for FabulaError {
    fn from(err: serde_json::Error) -> Self {
        FabulaError::JsonParse(err.to_string())
    }
}

impl From<std::io::Error> for FabulaError {
    fn from(err: std::io::Error) -> Self {
        FabulaError::Database(format!("I/O error: {}", err))
    }
}

impl From<reqwest::Error> for FabulaError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FabulaError::LlmTimeout(err.to_string())
        } else {
            FabulaError::LlmUnavailable(err.to_string())
        }
    }
}
