use crate::classifier::Domain;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for askflow operations
///
/// Only infrastructure faults surface through this type. Failures inside the
/// answering pipeline are [`DomainError`]s and end up as notes on an answer.
#[derive(Error, Debug)]
pub enum AskflowError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration validation errors
    #[error("Configuration validation failed: {errors:?}")]
    ConfigValidation { errors: Vec<ValidationError> },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Invalid configuration value
    #[error("Invalid configuration value at {path}: {message}")]
    InvalidConfigValue { path: String, message: String },

    /// IO errors
    #[error("IO error: {context}: {source}")]
    Io {
        source: std::io::Error,
        context: String,
    },

    /// TOML deserialization errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    /// JSON errors
    #[error("JSON error: {context}: {source}")]
    Json {
        source: serde_json::Error,
        context: String,
    },

    /// CSV errors while loading business data
    #[error("CSV error: {context}: {source}")]
    Csv { source: csv::Error, context: String },

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The chunk index has never been loaded
    #[error("Chunk index unavailable: {0}")]
    IndexUnavailable(String),

    /// The business dataset has never been loaded
    #[error("Business dataset unavailable: {0}")]
    DatasetUnavailable(String),

    /// Model provider could not be constructed
    #[error("Model provider error: {0}")]
    Provider(String),

    /// Generic errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration validation error
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Path to the configuration key that failed validation
    pub path: String,
    /// Error message describing the validation failure
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Recoverable failures inside the answering pipeline
///
/// Each variant is caught at the engine boundary and rendered into the answer
/// through [`DomainError::note`]. The type is `Clone` so a single failure can
/// be handed to every caller parked on the same fingerprint.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DomainError {
    #[error("classification ambiguous between {first} and {second}")]
    ClassificationAmbiguous { first: Domain, second: Domain },

    #[error("no relevant sources found")]
    RetrievalEmpty,

    #[error("model provider failed after {attempts} attempt(s): {message}")]
    ModelProvider { attempts: u32, message: String },

    #[error("plan generation failed: {0}")]
    PlanGeneration(String),

    #[error("sandbox execution failed: {0}")]
    SandboxExecution(String),

    #[error("response cache unavailable: {0}")]
    CacheUnavailable(String),
}

impl DomainError {
    /// User-facing explanation attached to an answer
    pub fn note(&self) -> String {
        match self {
            Self::ClassificationAmbiguous { first, second } => format!(
                "The question matched both {} and {} topics; results from both are shown separately.",
                first, second
            ),
            Self::RetrievalEmpty => {
                "No relevant sources were found; the answer is not backed by documents.".to_string()
            }
            Self::ModelProvider { attempts, .. } => format!(
                "The answer service is temporarily unavailable (gave up after {} attempt(s)); showing the retrieved material only.",
                attempts
            ),
            Self::PlanGeneration(reason) | Self::SandboxExecution(reason) => format!(
                "Unable to analyze this request with the available business data ({}).",
                reason
            ),
            Self::CacheUnavailable(_) => "Answer computed without the response cache.".to_string(),
        }
    }
}

/// Result type for askflow operations
pub type Result<T> = std::result::Result<T, AskflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_error_notes_are_readable() {
        let err = DomainError::ModelProvider {
            attempts: 3,
            message: "503".to_string(),
        };
        assert!(err.note().contains("3 attempt"));

        let err = DomainError::ClassificationAmbiguous {
            first: Domain::Business,
            second: Domain::Technical,
        };
        assert!(err.note().contains("business"));
        assert!(err.note().contains("technical"));
    }
}
