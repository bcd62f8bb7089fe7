// ── Fractal Memory Atoms: Error Types ──────────────────────────────────────
// Single canonical error enum for the engine, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by domain (I/O, DB, Network, Storage…).
//   • The `#[from]` attribute wires std/external error conversions automatically.
//   • Only Storage/Database/Io failures are meant to reach facade callers.
//     Embedding, index and dimension problems are recovered inside the engine.

use std::path::Path;
use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// SQLite / rusqlite database failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A durable file or database could not be opened or written.
    #[error("Storage unavailable: {path}: {message}")]
    Storage { path: String, message: String },

    /// Remote embedding backend unreachable, timed out, or answered garbage.
    #[error("Embedding unavailable: {0}")]
    Embedding(String),

    /// Persisted ANN structure is missing fields or has inconsistent widths.
    #[error("Malformed index: {0}")]
    MalformedIndex(String),

    /// Configuration file or override is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Catch-all for errors that do not yet have a dedicated variant.
    #[error("{0}")]
    Other(String),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl EngineError {
    /// Create a storage error tagged with the offending path.
    pub fn storage(path: impl AsRef<Path>, message: impl ToString) -> Self {
        Self::Storage {
            path: path.as_ref().display().to_string(),
            message: message.to_string(),
        }
    }

    /// True for failures that violate the durability contract.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage { .. } | Self::Database(_) | Self::Io(_))
    }
}

// ── Migration bridge: String → EngineError ─────────────────────────────────

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Other(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Other(s.to_string())
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(e: toml::de::Error) -> Self {
        EngineError::Config(e.to_string())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All engine operations return this type.
pub type EngineResult<T> = Result<T, EngineError>;

impl From<EngineError> for String {
    fn from(e: EngineError) -> Self {
        e.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_carries_path() {
        let err = EngineError::storage("/tmp/x/fmm.json", "permission denied");
        let msg = err.to_string();
        assert!(msg.contains("/tmp/x/fmm.json"), "got: {}", msg);
        assert!(msg.contains("permission denied"));
        assert!(err.is_storage());
    }

    #[test]
    fn test_recoverable_errors_are_not_storage() {
        assert!(!EngineError::Embedding("timeout".into()).is_storage());
        assert!(!EngineError::MalformedIndex("no centroids".into()).is_storage());
        assert!(!EngineError::from("plain").is_storage());
    }
}
