//! Identity for the almanac dataset node: Ed25519 key pairs, profiles whose
//! ids derive from the public key, and signed auth tokens.
//!
//! Key *generation* is out of scope — keys arrive as PEM via configuration
//! (or from [`keys::KeyPair::test_fixture`] in tests) and are held by the
//! [`KeyStore`].

pub mod error;
pub mod keys;
pub mod profile;
pub mod token;

pub use error::AuthError;
pub use keys::{KeyPair, KeyStore};
pub use profile::Profile;
pub use token::{create_token, token_key_id, verify_token, Claims, DEFAULT_TOKEN_TTL_SECONDS};
