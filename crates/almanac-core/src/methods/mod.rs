//! Method groups: the thin, typed implementations behind the dispatcher.
//!
//! Each group registers `group.method` names with their attribute sets;
//! implementations receive a per-call [`Scope`](crate::scope::Scope) and a
//! validated params struct, and stay free of transport concerns.

pub mod access;
pub mod dataset;
pub mod features;
pub mod fsi;
pub mod log;
pub mod profile;
pub mod remote;
pub mod search;
pub mod sql;

use serde::{Deserialize, Deserializer, Serializer};

use crate::dispatch::Dispatcher;
use crate::error::Error;

/// Register every method group.
pub fn register_all(d: &mut Dispatcher) {
    access::register(d);
    dataset::register(d);
    features::register(d);
    fsi::register(d);
    log::register(d);
    profile::register(d);
    remote::register(d);
    search::register(d);
    sql::register(d);
}

/// Selector grammar: dot-separated identifiers, case-sensitive.
pub fn validate_selector(selector: &str) -> Result<(), Error> {
    let valid = !selector.is_empty()
        && selector.split('.').all(|segment| {
            let mut chars = segment.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(Error::validation("invalid selector"))
    }
}

/// Substitute a leading `me/` in a ref string with the active username.
pub fn substitute_me_ref(reference: &mut String, active_username: &str) {
    if let Some(rest) = reference.strip_prefix("me/") {
        *reference = format!("{active_username}/{rest}");
    } else if reference == "me" {
        *reference = active_username.to_string();
    }
}

/// Byte payloads that cross the dispatcher as base64 strings.
pub mod b64 {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

/// A raw-bytes method result: alternate encodings (CSV, zip) flow through
/// the dispatcher in this envelope and are unwrapped at the transport.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RawBytes {
    pub content_type: String,
    #[serde(with = "b64")]
    pub body: Vec<u8>,
}
