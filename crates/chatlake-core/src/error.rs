//! Error types and result aliases for chatlake.
//!
//! Storage and coordination errors shared by every chatlake component.
//! Conditional-write conflicts are not errors: they come back as
//! [`crate::storage::WriteResult::PreconditionFailed`].

/// The result type used throughout chatlake.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in chatlake core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A path or object was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns true if this error means the object does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow disk");
        let err = Error::storage_with_source("read raw/a.json", io);
        assert_eq!(err.to_string(), "storage error: read raw/a.json");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn not_found_is_detected() {
        assert!(Error::NotFound("x".into()).is_not_found());
        assert!(!Error::storage("boom").is_not_found());
    }
}
