//! Signed auth tokens.
//!
//! A token is a JWT signed with the issuer's Ed25519 key: header
//! `{"alg":"EdDSA","typ":"JWT","kid":"<profile-id>"}`, payload
//! `{"iss","sub","iat","exp"}`. Verification checks the signature against
//! the issuer profile's public key and the `exp` claim.

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, decode_header, encode, Algorithm, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AuthError;
use crate::keys::KeyPair;

/// Default token lifetime when the caller does not supply one: two hours.
pub const DEFAULT_TOKEN_TTL_SECONDS: i64 = 2 * 60 * 60;

/// Token payload claims. Times are unix seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// Issue a token granting `subject_profile_id`, signed by `issuer`.
pub fn create_token(
    issuer: &KeyPair,
    subject_profile_id: &str,
    ttl_seconds: i64,
    now: DateTime<Utc>,
) -> Result<String, AuthError> {
    let mut header = Header::new(Algorithm::EdDSA);
    header.kid = Some(issuer.profile_id().to_string());
    let iat = now.timestamp();
    let claims = Claims {
        iss: issuer.profile_id().to_string(),
        sub: subject_profile_id.to_string(),
        iat,
        exp: iat + ttl_seconds,
    };
    let token = encode(&header, &claims, &issuer.encoding_key()?)
        .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
    debug!(iss = %claims.iss, sub = %claims.sub, exp = claims.exp, "issued auth token");
    Ok(token)
}

/// Extract the `kid` (issuer profile id) from a token header without
/// verifying the signature. Used to pick the verification key.
pub fn token_key_id(token: &str) -> Result<String, AuthError> {
    let header = decode_header(token).map_err(|e| AuthError::InvalidToken(e.to_string()))?;
    header
        .kid
        .ok_or_else(|| AuthError::InvalidToken("token header missing kid".into()))
}

/// Verify a token's signature and expiry against the issuer's key pair.
pub fn verify_token(token: &str, issuer: &KeyPair) -> Result<Claims, AuthError> {
    let mut validation = Validation::new(Algorithm::EdDSA);
    validation.set_required_spec_claims(&["exp"]);
    validation.validate_exp = true;
    let data = decode::<Claims>(token, &issuer.decoding_key()?, &validation).map_err(|e| {
        match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
            _ => AuthError::InvalidToken(e.to_string()),
        }
    })?;
    Ok(data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trip() {
        let pair = KeyPair::test_fixture();
        let token = create_token(&pair, pair.profile_id(), 120, Utc::now()).unwrap();
        let claims = verify_token(&token, &pair).unwrap();
        assert_eq!(claims.iss, pair.profile_id());
        assert_eq!(claims.sub, pair.profile_id());
        assert_eq!(claims.exp, claims.iat + 120);
    }

    #[test]
    fn kid_carries_issuer_profile_id() {
        let pair = KeyPair::test_fixture();
        let token = create_token(&pair, "someone-else", 120, Utc::now()).unwrap();
        assert_eq!(token_key_id(&token).unwrap(), pair.profile_id());
    }

    #[test]
    fn tampered_token_is_rejected() {
        let pair = KeyPair::test_fixture();
        let token = create_token(&pair, pair.profile_id(), 120, Utc::now()).unwrap();
        // Flip one byte in the payload segment.
        let mut bytes = token.into_bytes();
        let dot = bytes.iter().position(|&b| b == b'.').unwrap();
        bytes[dot + 1] = if bytes[dot + 1] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(bytes).unwrap();
        assert!(matches!(
            verify_token(&tampered, &pair),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn wrong_key_is_rejected() {
        let pair = KeyPair::test_fixture();
        let other = KeyPair::test_fixture_alt();
        let token = create_token(&pair, pair.profile_id(), 120, Utc::now()).unwrap();
        assert!(verify_token(&token, &other).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let pair = KeyPair::test_fixture();
        // Issued far enough in the past to defeat the default leeway.
        let then = Utc::now() - chrono::Duration::seconds(DEFAULT_TOKEN_TTL_SECONDS + 600);
        let token = create_token(&pair, pair.profile_id(), DEFAULT_TOKEN_TTL_SECONDS, then).unwrap();
        assert!(matches!(
            verify_token(&token, &pair),
            Err(AuthError::TokenExpired)
        ));
    }
}
