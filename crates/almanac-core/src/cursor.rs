//! Pagination cursors.
//!
//! A cursor is an opaque `(method, next-page-params)` pair. It serialises to
//! JSON and to a flat map suitable for an HTTP query string, whose keys are
//! the lowercased JSON field names of the next-page params.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub method: String,
    #[serde(rename = "nextParams")]
    pub next_params: Value,
}

impl Cursor {
    pub fn new<P: Serialize>(method: &str, next_params: &P) -> Result<Self, Error> {
        Ok(Self {
            method: method.to_string(),
            next_params: serde_json::to_value(next_params)?,
        })
    }

    /// Flatten the next-page params into query-string pairs. Scalar values
    /// are stringified; nested values are JSON-encoded.
    pub fn to_query_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        if let Value::Object(fields) = &self.next_params {
            for (key, value) in fields {
                let rendered = match value {
                    Value::Null => continue,
                    Value::String(s) => s.clone(),
                    Value::Bool(b) => b.to_string(),
                    Value::Number(n) => n.to_string(),
                    nested => nested.to_string(),
                };
                map.insert(key.to_ascii_lowercase(), rendered);
            }
        }
        map
    }
}
