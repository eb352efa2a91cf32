//! Error type for the record/replay cache.
//!
//! Every crate in the workspace returns [`Result<T>`]. "Not found" is never an
//! error: lookups return `Result<Option<T>>` so callers can tell an absent
//! record apart from an unreachable store.

use std::error::Error as StdError;

/// Primary error type.
#[derive(Debug, thiserror::Error)]
pub enum RcacheError {
    /// The persistence backend could not be reached (I/O, permissions,
    /// SQLite failure, poisoned lock file).
    #[error("storage unavailable: {detail}")]
    StorageUnavailable { detail: String },

    /// A persisted record failed validation on fetch.
    #[error("corrupt record `{key}`: {detail}")]
    Corrupt { key: String, detail: String },

    /// A value could not be encoded for persistence.
    #[error("cannot serialize {what}: {detail}")]
    Unserializable { what: String, detail: String },

    /// A context was exited more times than it was entered.
    #[error("context `{key}` exited more times than it was entered")]
    ContextUnderflow { key: String },

    /// A configured side effect raised an exception on purpose.
    #[error("{name} raised: {message}")]
    Raised { name: String, message: String },

    /// The wrapped callable failed; propagated unchanged.
    #[error(transparent)]
    Callable(Box<dyn StdError + Send + Sync + 'static>),

    /// No implementation is registered under a patch target.
    #[error("no implementation registered for `{target}`")]
    UnknownTarget { target: String },

    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RcacheError {
    pub fn storage(detail: impl Into<String>) -> Self {
        Self::StorageUnavailable {
            detail: detail.into(),
        }
    }

    pub fn corrupt(key: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Corrupt {
            key: key.into(),
            detail: detail.into(),
        }
    }

    pub fn unserializable(what: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Unserializable {
            what: what.into(),
            detail: detail.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Wrap an arbitrary error produced by a wrapped callable.
    pub fn callable<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Callable(Box::new(err))
    }

    /// Whether this error came from the persistence layer rather than from
    /// the code under test.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(
            self,
            Self::StorageUnavailable { .. } | Self::Corrupt { .. } | Self::Unserializable { .. }
        )
    }
}

impl From<std::io::Error> for RcacheError {
    fn from(err: std::io::Error) -> Self {
        Self::storage(err.to_string())
    }
}

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, RcacheError>;
