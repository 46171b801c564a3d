//! SQL execution over dataset-backed relations.

use serde::{Deserialize, Serialize};

use crate::dataset::{FORMAT_CSV, FORMAT_JSON};
use crate::dispatch::{AttributeSet, Dispatcher, MethodParams};
use crate::error::Error;
use crate::methods::RawBytes;
use crate::scope::Scope;
use crate::sql::{execute, parse, table_from_dataset, table_to_json};

pub fn register(d: &mut Dispatcher) {
    d.register("sql.exec", AttributeSet::post("/sql"), exec);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SqlParams {
    pub query: String,
    /// Output encoding: `json` (default) or `csv`.
    pub format: String,
    pub source: String,
}

impl Default for SqlParams {
    fn default() -> Self {
        Self {
            query: String::new(),
            format: FORMAT_JSON.to_string(),
            source: String::new(),
        }
    }
}

impl MethodParams for SqlParams {
    fn set_nonzero_defaults(&mut self) {
        if self.format.is_empty() {
            self.format = FORMAT_JSON.to_string();
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.query.is_empty() {
            return Err(Error::validation("query is required"));
        }
        if self.format != FORMAT_JSON && self.format != FORMAT_CSV {
            return Err(Error::validation(format!(
                "unsupported sql output format {:?}",
                self.format
            )));
        }
        Ok(())
    }

    fn source(&self) -> Option<&str> {
        Some(&self.source)
    }

    fn set_source(&mut self, source: &str) {
        self.source = source.to_string();
    }
}

/// Parse and run a query; the table identifier is a dataset ref resolved
/// through the loader.
pub async fn exec(scope: Scope, params: SqlParams) -> Result<RawBytes, Error> {
    let query = parse(&params.query)?;

    let mut table_ref = query.table.clone();
    if let Some(rest) = table_ref.strip_prefix("me/") {
        table_ref = format!("{}/{rest}", scope.active_username());
    }

    let ds = scope
        .loader()
        .load_dataset(scope.ctx(), &table_ref, &params.source)
        .await
        .map_err(|e| e.context("sql"))?;
    let table = table_from_dataset(&ds)?;
    let result = execute(&query, &table)?;

    if params.format == FORMAT_CSV {
        let csv_err = |e: csv::Error| Error::internal(format!("encoding csv: {e}"));
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&result.columns).map_err(csv_err)?;
        for row in &result.rows {
            let record: Vec<String> = row
                .iter()
                .map(|cell| match cell {
                    serde_json::Value::Null => String::new(),
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            writer.write_record(&record).map_err(csv_err)?;
        }
        let body = writer
            .into_inner()
            .map_err(|e| Error::internal(format!("encoding csv: {e}")))?;
        Ok(RawBytes {
            content_type: "text/csv".to_string(),
            body,
        })
    } else {
        Ok(RawBytes {
            content_type: "application/json".to_string(),
            body: serde_json::to_vec(&table_to_json(&result))?,
        })
    }
}
