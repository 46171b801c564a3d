//! The dataset value model: commit, meta, structure, body, and the side
//! components (readme, transform, viz), plus body file decoding.
//!
//! Bodies are held as JSON: CSV bodies become arrays of row arrays with the
//! column layout recorded in the structure's schema; JSON bodies are kept
//! as parsed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::Error;

/// Body encodings the node understands.
pub const FORMAT_JSON: &str = "json";
pub const FORMAT_CSV: &str = "csv";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dataset {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<Commit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structure: Option<Structure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readme: Option<Readme>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viz: Option<Viz>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Commit {
    pub title: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Meta {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Structure {
    pub format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    /// Row count of the body.
    pub entries: u64,
    /// Body size in bytes, in its native encoding.
    pub length: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Readme {
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Transform {
    pub script: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Viz {
    pub script: String,
}

impl Dataset {
    /// True when no component carries content.
    pub fn is_empty(&self) -> bool {
        self.meta.is_none()
            && self.structure.is_none()
            && self.readme.is_none()
            && self.transform.is_none()
            && self.viz.is_none()
            && self.body.is_none()
    }

    /// Body rows as a slice; errors when the body is not an array.
    pub fn body_rows(&self) -> Result<&[Value], Error> {
        match &self.body {
            Some(Value::Array(rows)) => Ok(rows),
            Some(_) => Err(Error::validation("dataset body is not an array")),
            None => Ok(&[]),
        }
    }

    /// Projection used for change detection: everything that makes a version
    /// except the commit, which always differs.
    pub fn change_signature(&self) -> Value {
        json!({
            "meta": self.meta,
            "structure": self.structure.as_ref().map(|s| json!({
                "format": s.format,
                "schema": s.schema,
            })),
            "readme": self.readme,
            "transform": self.transform,
            "viz": self.viz,
            "body": self.body,
        })
    }

    /// Overlay display identity onto a loaded dataset.
    pub fn with_ref(mut self, username: &str, name: &str, path: &str) -> Self {
        self.username = username.to_string();
        self.name = name.to_string();
        self.path = path.to_string();
        self
    }
}

/// A decoded body file.
#[derive(Debug, Clone)]
pub struct BodyFile {
    /// Rows as a JSON array.
    pub rows: Value,
    pub format: String,
    /// Byte length of the native encoding.
    pub length: u64,
    /// Schema derived from the encoding (CSV headers), if any.
    pub schema: Option<Value>,
}

impl BodyFile {
    pub fn entries(&self) -> u64 {
        match &self.rows {
            Value::Array(rows) => rows.len() as u64,
            _ => 1,
        }
    }
}

/// Decode body bytes by format name (`csv` or `json`).
pub fn decode_body(format: &str, bytes: &[u8]) -> Result<BodyFile, Error> {
    match format {
        FORMAT_CSV => decode_csv_body(bytes),
        FORMAT_JSON => {
            let rows: Value = serde_json::from_slice(bytes)
                .map_err(|e| Error::validation(format!("body file: invalid json: {e}")))?;
            Ok(BodyFile {
                rows,
                format: FORMAT_JSON.to_string(),
                length: bytes.len() as u64,
                schema: None,
            })
        }
        other => Err(Error::validation(format!(
            "body file: unsupported format {other:?}"
        ))),
    }
}

/// Infer a body format from a file extension.
pub fn format_from_extension(path: &std::path::Path) -> Result<&'static str, Error> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("csv") => Ok(FORMAT_CSV),
        Some("json") => Ok(FORMAT_JSON),
        other => Err(Error::validation(format!(
            "body file: unsupported extension {:?}",
            other.unwrap_or("")
        ))),
    }
}

fn decode_csv_body(bytes: &[u8]) -> Result<BodyFile, Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(bytes);
    let headers = reader
        .headers()
        .map_err(|e| Error::validation(format!("body file: invalid csv: {e}")))?
        .clone();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| Error::validation(format!("body file: invalid csv: {e}")))?;
        let row: Vec<Value> = record.iter().map(parse_csv_cell).collect();
        rows.push(Value::Array(row));
    }
    Ok(BodyFile {
        rows: Value::Array(rows),
        format: FORMAT_CSV.to_string(),
        length: bytes.len() as u64,
        schema: Some(schema_for_headers(&headers)),
    })
}

fn parse_csv_cell(cell: &str) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }
    if let Ok(n) = cell.parse::<i64>() {
        return json!(n);
    }
    if let Ok(f) = cell.parse::<f64>() {
        return json!(f);
    }
    match cell {
        "true" => json!(true),
        "false" => json!(false),
        _ => json!(cell),
    }
}

/// Tabular schema for a CSV header row: an array-of-arrays description with
/// one titled column entry per header.
fn schema_for_headers(headers: &csv::StringRecord) -> Value {
    let cols: Vec<Value> = headers.iter().map(|h| json!({ "title": h })).collect();
    json!({
        "type": "array",
        "items": { "type": "array", "items": cols },
    })
}

/// Column titles recorded in a tabular schema, in order.
pub fn schema_columns(schema: &Value) -> Option<Vec<String>> {
    let items = schema.get("items")?.get("items")?.as_array()?;
    let cols = items
        .iter()
        .map(|c| {
            c.get("title")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_default()
        })
        .collect();
    Some(cols)
}

/// Encode body rows as CSV bytes with a header row.
pub fn encode_csv(rows: &[Value], schema: Option<&Value>) -> Result<Vec<u8>, Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let columns = schema.and_then(schema_columns);
    if let Some(cols) = &columns {
        writer
            .write_record(cols)
            .map_err(|e| Error::internal(format!("encoding csv: {e}")))?;
    } else if let Some(Value::Object(first)) = rows.first() {
        let keys: Vec<&String> = first.keys().collect();
        writer
            .write_record(keys)
            .map_err(|e| Error::internal(format!("encoding csv: {e}")))?;
    }
    for row in rows {
        let record: Vec<String> = match row {
            Value::Array(cells) => cells.iter().map(cell_to_string).collect(),
            Value::Object(map) => map.values().map(cell_to_string).collect(),
            other => vec![cell_to_string(other)],
        };
        writer
            .write_record(&record)
            .map_err(|e| Error::internal(format!("encoding csv: {e}")))?;
    }
    writer
        .into_inner()
        .map_err(|e| Error::internal(format!("encoding csv: {e}")))
}

fn cell_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CITIES_CSV: &[u8] =
        b"city,pop,avg_age,in_usa\ntoronto,40000000,55.5,false\nnew york,8500000,44.4,true\n";

    #[test]
    fn decode_csv_keeps_rows_and_headers() {
        let body = decode_body(FORMAT_CSV, CITIES_CSV).unwrap();
        assert_eq!(body.entries(), 2);
        assert_eq!(body.length as usize, CITIES_CSV.len());
        let cols = schema_columns(body.schema.as_ref().unwrap()).unwrap();
        assert_eq!(cols, vec!["city", "pop", "avg_age", "in_usa"]);
        let rows = body.rows.as_array().unwrap();
        assert_eq!(rows[0][0], "toronto");
        assert_eq!(rows[0][1], 40000000);
        assert_eq!(rows[0][3], false);
    }

    #[test]
    fn decode_json_array() {
        let body = decode_body(FORMAT_JSON, b"[{\"a\":1},{\"a\":2}]").unwrap();
        assert_eq!(body.entries(), 2);
        assert!(body.schema.is_none());
    }

    #[test]
    fn decode_errors_carry_context() {
        let err = decode_body(FORMAT_JSON, b"{not json").unwrap_err();
        assert!(err.to_string().starts_with("body file:"));
        let err = decode_body("parquet", b"").unwrap_err();
        assert!(err.to_string().contains("unsupported format"));
    }

    #[test]
    fn csv_round_trip() {
        let body = decode_body(FORMAT_CSV, CITIES_CSV).unwrap();
        let rows = body.rows.as_array().unwrap();
        let encoded = encode_csv(rows, body.schema.as_ref()).unwrap();
        let reparsed = decode_body(FORMAT_CSV, &encoded).unwrap();
        assert_eq!(reparsed.rows, body.rows);
    }

    #[test]
    fn change_signature_ignores_commit() {
        let mut a = Dataset {
            body: Some(json!([[1, 2]])),
            ..Default::default()
        };
        let mut b = a.clone();
        a.commit = Some(Commit {
            title: "first".into(),
            ..Default::default()
        });
        b.commit = Some(Commit {
            title: "second".into(),
            ..Default::default()
        });
        assert_eq!(a.change_signature(), b.change_signature());
    }

    #[test]
    fn body_rows_requires_array() {
        let ds = Dataset {
            body: Some(json!({"a": 1})),
            ..Default::default()
        };
        assert!(ds.body_rows().is_err());
    }
}
