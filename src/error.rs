//! Error taxonomy: four wire codes plus pass-through I/O and resolver errors.

use thiserror::Error;

/// Errors surfaced by the cache. Variants are cloneable so a single phase
/// failure can be broadcast to every coalesced requester.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("source file not found: {path}")]
    NotFound { path: String },

    #[error("no legacy transform for {path}")]
    NoTransform { path: String },

    #[error("unsupported module format for {path}")]
    UnsupportedFormat { path: String },

    #[error("{message}")]
    Transform { message: String },

    #[error("{message}")]
    Resolve { message: String },

    #[error("{message}")]
    Io { message: String },
}

impl Error {
    pub fn transform(message: impl Into<String>) -> Self {
        Error::Transform {
            message: message.into(),
        }
    }

    pub fn io(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
        }
    }

    /// The wire tag consumed by the serving layer, if this error carries one.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Error::NotFound { .. } => Some("not-found"),
            Error::NoTransform { .. } => Some("no-transform"),
            Error::UnsupportedFormat { .. } => Some("unsupported-format"),
            Error::Transform { .. } => Some("transform-error"),
            Error::Resolve { .. } | Error::Io { .. } => None,
        }
    }
}
