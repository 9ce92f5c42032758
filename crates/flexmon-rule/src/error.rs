use std::path::PathBuf;

/// Errors that can occur while parsing, persisting or removing rules.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    /// The document is not valid JSON, or a field has the wrong shape
    /// (e.g. a predicate list that is not an array).
    #[error("Rule: invalid JSON: {0}")]
    InvalidJson(String),

    /// A rule with this name is already present in the store.
    #[error("Rule: '{0}' already exists")]
    AlreadyExists(String),

    /// No rule with this name is present in the store.
    #[error("Rule: '{0}' does not exist")]
    DoesNotExist(String),

    /// Writing the `.rule` file failed; the in-memory store is unchanged.
    #[error("Rule: failed to save '{path}': {source}")]
    SaveFailure {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Unlinking the `.rule` file failed; the rule stays in the store.
    #[error("Rule: failed to remove '{path}': {source}")]
    CanNotRemove {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Any other I/O failure (directory scan, file read).
    #[error("Rule: I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience `Result` alias for rule operations.
pub type Result<T> = std::result::Result<T, RuleError>;
