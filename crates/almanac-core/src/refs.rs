//! Dataset references.
//!
//! A ref is `(username, name, profile-id?, path?)` with the canonical string
//! forms `user/name` and `user/name@path`. The special username `me` is an
//! API-boundary shortcut for the active profile; it is substituted exactly
//! once, when a call's scope is built, and never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Error;

/// Maximum length of a username or dataset name.
pub const MAX_NAME_LENGTH: usize = 144;

/// The `me` convenience username.
pub const ME: &str = "me";

/// A human-readable handle for a dataset, optionally pinned to a version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ref {
    pub username: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Ref {
    pub fn new(username: &str, name: &str) -> Self {
        Self {
            username: username.to_string(),
            name: name.to_string(),
            profile_id: None,
            path: None,
        }
    }

    /// Parse a ref in a persisted position: mixed-case names are a hard
    /// error here.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        parse_ref(raw, true)
    }

    /// Parse a ref on a read path: upper-case characters in the name are
    /// lowered with a warning instead of rejected.
    pub fn parse_relaxed(raw: &str) -> Result<Self, Error> {
        parse_ref(raw, false)
    }

    /// `username/name`, the unpinned canonical form.
    pub fn alias(&self) -> String {
        format!("{}/{}", self.username, self.name)
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.name.is_empty()
    }

    pub fn is_me(&self) -> bool {
        self.username == ME
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    /// Replace the `me` username with the active profile's username.
    pub fn substitute_me(&mut self, active_username: &str) {
        if self.is_me() {
            self.username = active_username.to_string();
        }
    }
}

impl std::fmt::Display for Ref {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.username, self.name)?;
        if let Some(path) = &self.path {
            write!(f, "@{path}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Ref {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Error> {
        Ref::parse(raw)
    }
}

fn parse_ref(raw: &str, strict: bool) -> Result<Ref, Error> {
    if raw.trim().is_empty() {
        return Err(Error::validation("empty reference"));
    }
    let (alias, path) = match raw.split_once('@') {
        Some((alias, path)) if path.is_empty() => {
            return Err(Error::validation(format!("empty path in reference {alias:?}")))
        }
        Some((alias, path)) => (alias, Some(path.to_string())),
        None => (raw, None),
    };
    let (username, name) = alias
        .split_once('/')
        .ok_or_else(|| Error::validation(format!("invalid reference {raw:?}, expected username/name")))?;
    if username.is_empty() || name.is_empty() {
        return Err(Error::validation(format!(
            "invalid reference {raw:?}, expected username/name"
        )));
    }
    if name.contains('/') {
        return Err(Error::validation(format!(
            "invalid reference {raw:?}, too many path segments"
        )));
    }

    if username != ME {
        validate_name(username).map_err(|e| e.context("username"))?;
    }

    let name = if strict {
        validate_name(name).map_err(|e| e.context("dataset name"))?;
        name.to_string()
    } else {
        match validate_name(name) {
            Ok(()) => name.to_string(),
            Err(_) if name_fixable(name) => {
                let lowered = name.to_ascii_lowercase();
                warn!(name, lowered, "mixed-case dataset name accepted on read path");
                validate_name(&lowered).map_err(|e| e.context("dataset name"))?;
                lowered
            }
            Err(e) => return Err(e.context("dataset name")),
        }
    };

    Ok(Ref {
        username: username.to_string(),
        name,
        profile_id: None,
        path,
    })
}

/// True when lowering the name would make it valid.
fn name_fixable(name: &str) -> bool {
    name.chars().any(|c| c.is_ascii_uppercase())
}

/// Validate a username or dataset name: non-empty, at most 144 characters,
/// lowercase `[a-z][a-z0-9_]*`.
pub fn validate_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::validation("name is empty"));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(Error::validation(format!(
            "name is too long, must be at most {MAX_NAME_LENGTH} characters"
        )));
    }
    let mut chars = name.chars();
    let first = chars.next().expect("name is non-empty");
    if !first.is_ascii_lowercase() {
        return Err(Error::validation(format!(
            "name {name:?} must start with a lowercase letter"
        )));
    }
    for c in chars {
        if !(c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
            return Err(Error::validation(format!(
                "name {name:?} contains invalid character {c:?}"
            )));
        }
    }
    Ok(())
}

/// Summary of one dataset version, as listed by history and search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VersionInfo {
    pub username: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
    pub path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub commit_title: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub commit_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_time: Option<DateTime<Utc>>,
    pub body_size: u64,
    pub body_rows: u64,
    pub published: bool,
    /// True when the version is known by reference but its content is not
    /// locally present.
    pub foreign: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub fsi_path: String,
}

impl VersionInfo {
    pub fn alias(&self) -> String {
        format!("{}/{}", self.username, self.name)
    }

    pub fn simple_ref(&self) -> Ref {
        Ref {
            username: self.username.clone(),
            name: self.name.clone(),
            profile_id: self.profile_id.clone(),
            path: if self.path.is_empty() {
                None
            } else {
                Some(self.path.clone())
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_alias_form() {
        let r = Ref::parse("peer/city_data").unwrap();
        assert_eq!(r.username, "peer");
        assert_eq!(r.name, "city_data");
        assert_eq!(r.path, None);
    }

    #[test]
    fn parse_pinned_form() {
        let r = Ref::parse("peer/city_data@/store/1220abcd").unwrap();
        assert_eq!(r.path.as_deref(), Some("/store/1220abcd"));
    }

    #[test]
    fn round_trip_format_then_parse() {
        for raw in ["peer/city_data", "peer/city_data@/store/1220abcd", "me/x9"] {
            let r = Ref::parse(raw).unwrap();
            assert_eq!(Ref::parse(&r.to_string()).unwrap(), r);
        }
    }

    #[test]
    fn empty_reference_is_rejected() {
        assert!(Ref::parse("").is_err());
        assert!(Ref::parse("   ").is_err());
    }

    #[test]
    fn missing_name_segment_is_rejected() {
        assert!(Ref::parse("peer").is_err());
        assert!(Ref::parse("peer/").is_err());
        assert!(Ref::parse("/data").is_err());
    }

    #[test]
    fn upper_case_name_is_a_hard_error_when_persisted() {
        let err = Ref::parse("peer/CityData").unwrap_err();
        assert!(err.to_string().contains("lowercase"));
    }

    #[test]
    fn relaxed_parse_lowers_mixed_case_names() {
        let r = Ref::parse_relaxed("peer/CityData").unwrap();
        assert_eq!(r.name, "citydata");
    }

    #[test]
    fn me_is_allowed_at_parse_time() {
        let mut r = Ref::parse("me/city_data").unwrap();
        assert!(r.is_me());
        r.substitute_me("peer");
        assert_eq!(r.username, "peer");
    }

    #[test]
    fn invalid_characters_are_rejected() {
        assert!(Ref::parse("peer/city-data").is_err());
        assert!(Ref::parse("peer/9data").is_err());
        assert!(Ref::parse("pe er/data").is_err());
    }

    #[test]
    fn name_length_limit() {
        let long = "a".repeat(MAX_NAME_LENGTH + 1);
        assert!(validate_name(&long).is_err());
        let ok = "a".repeat(MAX_NAME_LENGTH);
        assert!(validate_name(&ok).is_ok());
    }

    #[test]
    fn empty_path_after_at_is_rejected() {
        assert!(Ref::parse("peer/data@").is_err());
    }
}
