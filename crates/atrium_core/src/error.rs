//! Core error types for ATRIUM.

use std::fmt;

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Not found
    NotFound {
        /// Kind of item looked up
        kind: String,
        /// Identifier that was missing
        id: String,
    },

    /// Already exists
    AlreadyExists {
        /// Kind of item registered
        kind: String,
        /// Identifier that was duplicated
        id: String,
    },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { kind, id } => write!(f, "{} not found: {}", kind, id),
            Self::AlreadyExists { kind, id } => write!(f, "{} already exists: {}", kind, id),
        }
    }
}

impl std::error::Error for CoreError {}

impl CoreError {
    /// Shorthand for a missing item
    #[must_use]
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Shorthand for a duplicate item
    #[must_use]
    pub fn already_exists(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            id: id.into(),
        }
    }
}
