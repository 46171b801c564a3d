/// Errors from key handling and token verification.
#[derive(Debug)]
pub enum AuthError {
    /// The PEM/DER material could not be parsed.
    InvalidKey(String),
    /// No stored key pair for the requested profile.
    KeyMissing(String),
    /// The token is malformed or its signature does not verify.
    InvalidToken(String),
    /// The token verified but its `exp` claim is in the past.
    TokenExpired,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::InvalidKey(msg) => write!(f, "invalid key: {msg}"),
            AuthError::KeyMissing(id) => write!(f, "no key pair stored for profile {id}"),
            AuthError::InvalidToken(msg) => write!(f, "invalid token: {msg}"),
            AuthError::TokenExpired => write!(f, "token expired"),
        }
    }
}

impl std::error::Error for AuthError {}
