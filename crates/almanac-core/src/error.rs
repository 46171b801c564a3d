//! Domain error taxonomy.
//!
//! Errors carry a kind plus a stable human message. Implementations never
//! format transport codes; mapping to HTTP status or exit codes happens at
//! the transport boundary only.

use almanac_auth::AuthError;

/// Classification of a domain error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad input; surfaced verbatim, never retried.
    Validation,
    /// A ref, blob, log, or method that does not exist.
    NotFound,
    /// Rename collisions, no-change saves, and similar.
    Conflict,
    /// Token missing, invalid, or expired.
    Unauthorized,
    /// Network failures worth retrying once.
    TransientNetwork,
    /// The request context was cancelled.
    Cancelled,
    /// Everything else; logged and surfaced opaquely.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::TransientNetwork => "transient-network",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

/// A domain error. `Clone` so coalesced loads can share one outcome.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientNetwork, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "context cancelled")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Wrap with a short human context, keeping the kind.
    pub fn context(self, context: &str) -> Self {
        Self {
            kind: self.kind,
            message: format!("{context}: {}", self.message),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::internal(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::internal(err.to_string())
    }
}

impl From<AuthError> for Error {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::TokenExpired | AuthError::InvalidToken(_) => {
                Error::unauthorized(err.to_string())
            }
            AuthError::KeyMissing(_) => Error::not_found(err.to_string()),
            AuthError::InvalidKey(_) => Error::validation(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_wraps_message_and_keeps_kind() {
        let err = Error::not_found("reference not found").context("loading dataset");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "loading dataset: reference not found");
    }

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(ErrorKind::TransientNetwork.as_str(), "transient-network");
        assert_eq!(ErrorKind::NotFound.as_str(), "not-found");
    }

    #[test]
    fn auth_errors_map_to_unauthorized() {
        let err: Error = AuthError::TokenExpired.into();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }
}
