//! Error types for the memory engine.
//!
//! One error enum covers every service. Transient model-runtime failures
//! (embedder / language model) are distinct variants so callers can degrade
//! instead of failing the whole operation; schema problems are fatal at
//! startup and never swallowed.

/// Engine-wide error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Database I/O or constraint failure
    #[error("database error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// IO error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Row missing where the caller required one
    #[error("not found: {0}")]
    NotFound(String),

    /// A name resolves to more than one entity
    #[error("ambiguous name '{name}' ({} candidates)", candidates.len())]
    Ambiguous {
        /// The name as given by the caller
        name: String,
        /// Canonical names of every matching entity
        candidates: Vec<String>,
    },

    /// Embedding service down or timed out; callers persist without a vector
    #[error("embedding service unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// Language model down or timed out; callers fall back to regex extraction
    #[error("language model unavailable: {0}")]
    LanguageModelUnavailable(String),

    /// Schema integrity could not be established (fatal at startup)
    #[error("migration failure: {0}")]
    MigrationFailure(String),

    /// Embedding dimension disagrees with the store (fatal at startup)
    #[error("embedding dimension mismatch: store expects {expected}, model produced {actual}")]
    SchemaMismatch {
        /// Dimension the store was created with
        expected: usize,
        /// Dimension the model actually produced
        actual: usize,
    },

    /// A per-call timeout elapsed
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Bad configuration (exit code 2 territory)
    #[error("configuration error: {0}")]
    Config(String),

    /// Caller-supplied arguments failed validation
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Unexpected internal state (poisoned lock, trapped panic)
    #[error("internal error: {0}")]
    Internal(String),
}

impl MemoryError {
    /// Stable machine-readable kind, used in tool-protocol error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            MemoryError::Storage(_) | MemoryError::Io(_) | MemoryError::Internal(_) => {
                "StorageError"
            }
            MemoryError::NotFound(_) => "NotFound",
            MemoryError::Ambiguous { .. } => "Ambiguous",
            MemoryError::EmbeddingUnavailable(_) => "EmbeddingUnavailable",
            MemoryError::LanguageModelUnavailable(_) => "LanguageModelUnavailable",
            MemoryError::MigrationFailure(_) => "MigrationFailure",
            MemoryError::SchemaMismatch { .. } => "SchemaMismatch",
            MemoryError::DeadlineExceeded(_) => "DeadlineExceeded",
            MemoryError::Config(_) => "ConfigError",
            MemoryError::InvalidInput(_) => "InvalidInput",
        }
    }

    /// Whether this error should halt the daemon rather than be returned to
    /// the tool caller.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MemoryError::MigrationFailure(_) | MemoryError::SchemaMismatch { .. }
        )
    }

    /// Shorthand for a poisoned-lock failure.
    pub(crate) fn lock(what: &str) -> Self {
        MemoryError::Internal(format!("{} lock poisoned", what))
    }
}

/// Engine-wide result type
pub type Result<T> = std::result::Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_stable() {
        assert_eq!(MemoryError::NotFound("x".into()).kind(), "NotFound");
        assert_eq!(
            MemoryError::EmbeddingUnavailable("down".into()).kind(),
            "EmbeddingUnavailable"
        );
        assert_eq!(
            MemoryError::SchemaMismatch {
                expected: 384,
                actual: 768
            }
            .kind(),
            "SchemaMismatch"
        );
    }

    #[test]
    fn fatal_errors_are_schema_level() {
        assert!(MemoryError::MigrationFailure("bad".into()).is_fatal());
        assert!(MemoryError::SchemaMismatch {
            expected: 384,
            actual: 768
        }
        .is_fatal());
        assert!(!MemoryError::NotFound("x".into()).is_fatal());
        assert!(!MemoryError::EmbeddingUnavailable("down".into()).is_fatal());
    }
}
