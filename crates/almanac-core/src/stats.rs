//! Per-column body summaries.

use std::collections::BTreeSet;

use serde_json::{json, Value};

use crate::dataset::schema_columns;

/// Cap on the distinct-value sample kept per string column.
const DISTINCT_SAMPLE_CAP: usize = 200;

/// Compute per-column statistics over body rows.
///
/// Rows may be arrays (column order from the schema) or objects (columns
/// are the union of keys). Returns one summary object per column.
pub fn column_stats(rows: &[Value], schema: Option<&Value>) -> Value {
    let columns = column_names(rows, schema);
    let summaries: Vec<Value> = columns
        .iter()
        .enumerate()
        .map(|(index, name)| summarize_column(rows, index, name))
        .collect();
    Value::Array(summaries)
}

fn column_names(rows: &[Value], schema: Option<&Value>) -> Vec<String> {
    if let Some(cols) = schema.and_then(schema_columns) {
        return cols;
    }
    match rows.first() {
        Some(Value::Object(_)) => {
            let mut names = BTreeSet::new();
            for row in rows {
                if let Value::Object(map) = row {
                    names.extend(map.keys().cloned());
                }
            }
            names.into_iter().collect()
        }
        Some(Value::Array(first)) => (0..first.len()).map(|i| format!("col_{i}")).collect(),
        _ => Vec::new(),
    }
}

fn cell<'a>(row: &'a Value, index: usize, name: &str) -> Option<&'a Value> {
    match row {
        Value::Array(cells) => cells.get(index),
        Value::Object(map) => map.get(name),
        _ => None,
    }
}

/// `count` is the number of non-null values; missing cells and explicit
/// nulls both land in `nullCount`.
fn summarize_column(rows: &[Value], index: usize, name: &str) -> Value {
    let mut count = 0usize;
    let mut nulls = 0usize;
    let mut numbers = Vec::new();
    let mut strings: BTreeSet<String> = BTreeSet::new();
    let mut trues = 0usize;
    let mut bools = 0usize;

    for row in rows {
        let Some(value) = cell(row, index, name) else {
            nulls += 1;
            continue;
        };
        match value {
            Value::Null => nulls += 1,
            Value::Number(n) => {
                count += 1;
                if let Some(f) = n.as_f64() {
                    numbers.push(f);
                }
            }
            Value::String(s) => {
                count += 1;
                if strings.len() < DISTINCT_SAMPLE_CAP {
                    strings.insert(s.clone());
                }
            }
            Value::Bool(b) => {
                count += 1;
                bools += 1;
                if *b {
                    trues += 1;
                }
            }
            _ => count += 1,
        }
    }

    let mut summary = json!({
        "name": name,
        "count": count,
        "nullCount": nulls,
        "type": dominant_type(&numbers, &strings, bools),
    });
    if !numbers.is_empty() {
        let min = numbers.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = numbers.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let mean = numbers.iter().sum::<f64>() / numbers.len() as f64;
        summary["min"] = json!(min);
        summary["max"] = json!(max);
        summary["mean"] = json!(mean);
    }
    if !strings.is_empty() {
        summary["distinct"] = json!(strings.len());
    }
    if bools > 0 {
        summary["trueCount"] = json!(trues);
    }
    summary
}

fn dominant_type(numbers: &[f64], strings: &BTreeSet<String>, bools: usize) -> &'static str {
    let counts = [
        ("number", numbers.len()),
        ("string", strings.len()),
        ("boolean", bools),
    ];
    counts
        .iter()
        .max_by_key(|(_, n)| *n)
        .filter(|(_, n)| *n > 0)
        .map(|(name, _)| *name)
        .unwrap_or("null")
}
