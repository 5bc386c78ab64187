//! Error types for vmctl

use thiserror::Error;

/// Result type alias using vmctl Error
pub type Result<T> = std::result::Result<T, Error>;

/// Request-terminal error taxonomy.
///
/// Every variant ends the request; nothing is retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Token signature is invalid, expired, or the token is missing.
    #[error("Unauthorized")]
    Unauthorized,

    /// Verified token lacks a usable `vm` or `operation` claim.
    #[error("Bad Request: {0}")]
    BadRequest(String),

    /// Operation is not on the allow-list.
    #[error("Forbidden operation: {0}")]
    Forbidden(String),

    /// The hypervisor CLI reported a failure; carries the captured error text.
    #[error("{0}")]
    ExecutionFailure(String),
}

impl Error {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Error::BadRequest(msg.into())
    }
}
