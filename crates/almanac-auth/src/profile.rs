use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::keys::KeyPair;

/// A peer identity. The id derives from the profile's public key; exactly
/// one profile is the *owner* of a running instance.
///
/// Private key material never appears here — it stays in the
/// [`KeyStore`](crate::KeyStore).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub peername: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Profile {
    /// Build a profile for a key pair.
    pub fn new(peername: &str, pair: &KeyPair, now: DateTime<Utc>) -> Self {
        Self {
            id: pair.profile_id().to_string(),
            peername: peername.to_string(),
            email: None,
            description: None,
            created: now,
            updated: now,
        }
    }
}
