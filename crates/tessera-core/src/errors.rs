//! Unified error type for the Tessera core
//!
//! A single enum carries the whole rejection taxonomy so that errors can
//! cross crate boundaries (and fetch promises) without conversion layers.
//! Variants are cloneable: a fetch request's latched failure is handed to
//! every listener attached to it.

use serde::{Deserialize, Serialize};

/// Result alias used throughout the Tessera crates.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for event evaluation and federated fetch.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
pub enum Error {
    /// No peer can satisfy a fetch, or a queried entity is absent.
    #[error("Not found: {message}")]
    NotFound {
        /// What could not be located
        message: String,
    },

    /// Structural rejection by the conformance check.
    #[error("Event does not conform: {report}")]
    NotConform {
        /// Space-separated conformance failure names
        report: String,
    },

    /// Signature verification failed while the key was cached.
    #[error("Bad signature: {message}")]
    BadSignature {
        /// Which signature failed and why
        message: String,
    },

    /// The authorization rules reject the event.
    #[error("Unauthorized: {message}")]
    Unauthorized {
        /// Which rule rejected the event
        message: String,
    },

    /// The process runlevel does not accept new work.
    #[error("Unavailable: {message}")]
    Unavailable {
        /// Why the operation cannot be accepted
        message: String,
    },

    /// A single federation attempt exceeded its wall clock budget.
    #[error("Request timed out after {timeout_secs}s")]
    RequestTimeout {
        /// The per-attempt budget that was exceeded
        timeout_secs: u64,
    },

    /// Malformed or oversized JSON.
    #[error("Bad JSON: {message}")]
    BadJson {
        /// What failed to parse or normalize
        message: String,
    },

    /// A remote peer produced an erroneous response.
    #[error("Remote error: {message}")]
    Remote {
        /// Transport or protocol level failure description
        message: String,
    },

    /// The storage commit aborted.
    #[error("Storage failure: {message}")]
    Storage {
        /// What the engine reported
        message: String,
    },
}

impl Error {
    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a conformance rejection from a report string
    pub fn not_conform(report: impl Into<String>) -> Self {
        Self::NotConform {
            report: report.into(),
        }
    }

    /// Create a bad signature error
    pub fn bad_signature(message: impl Into<String>) -> Self {
        Self::BadSignature {
            message: message.into(),
        }
    }

    /// Create an authorization rejection
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    /// Create an unavailable error
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Create a bad JSON error
    pub fn bad_json(message: impl Into<String>) -> Self {
        Self::BadJson {
            message: message.into(),
        }
    }

    /// Create a remote error
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    /// Create a storage failure
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::bad_json(err.to_string())
    }
}
