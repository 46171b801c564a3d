//! The HTTP front-end.
//!
//! Routes are defined by the dispatcher's attribute sets (`endpoint` +
//! verb). Each handler assembles method params from the trailing path
//! segment, the query string, and a JSON or multipart body, dispatches,
//! and encodes the result: JSON by default, raw bytes for the CSV/zip/SQL
//! encodings, NDJSON when a paginated caller asks the handler to iterate
//! the cursor.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{FromRequest, Multipart, RawQuery, Request, WebSocketUpgrade};
use axum::http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Map, Value};
use tracing::debug;

use almanac_core::dispatch::HttpVerb;
use almanac_core::methods::RawBytes;
use almanac_core::{Error, Instance};

use crate::error::ApiError;
use crate::ws;

/// Methods whose results are raw byte payloads, not JSON documents.
const RAW_METHODS: [&str; 3] = ["dataset.getcsv", "dataset.getzip", "sql.exec"];

/// Build the router from the instance's method registry.
pub fn router(instance: Arc<Instance>) -> Router {
    let mut router = Router::new();
    let specs: Vec<(String, &'static str, HttpVerb)> = instance
        .dispatcher()
        .methods()
        .filter(|spec| !spec.attrs().deny_rpc)
        .filter_map(|spec| {
            spec.attrs()
                .endpoint
                .map(|endpoint| (spec.name().to_string(), endpoint, spec.attrs().verb))
        })
        .collect();

    for (name, endpoint, verb) in specs {
        let path = axum_path(endpoint);
        let handler = {
            let instance = instance.clone();
            move |req: Request| {
                let instance = instance.clone();
                let name = name.clone();
                async move { handle_method(instance, name, endpoint, req).await }
            }
        };
        router = match verb {
            HttpVerb::Get => router.route(&path, get(handler)),
            HttpVerb::Post => router.route(&path, post(handler)),
        };
    }

    let events = {
        let instance = instance.clone();
        move |upgrade: WebSocketUpgrade, headers: HeaderMap, RawQuery(query): RawQuery| {
            let instance = instance.clone();
            async move { ws::events_handler(instance, upgrade, headers, query).await }
        }
    };
    router.route("/events", get(events))
}

/// Translate an attribute-set endpoint into axum 0.8 route syntax.
fn axum_path(endpoint: &str) -> String {
    endpoint.replace("{ref...}", "{*ref}")
}

/// The static prefix before a `{ref...}` wildcard, if the endpoint has one.
fn wildcard_prefix(endpoint: &str) -> Option<&str> {
    endpoint.split("{ref...}").next().filter(|_| endpoint.contains("{ref...}"))
}

async fn handle_method(
    instance: Arc<Instance>,
    mut name: String,
    endpoint: &'static str,
    req: Request,
) -> Response {
    let token = bearer_token(req.headers());
    let wants_ndjson = req
        .headers()
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/x-ndjson"))
        .unwrap_or(false);

    let path_ref = wildcard_prefix(endpoint).and_then(|prefix| {
        req.uri()
            .path()
            .strip_prefix(prefix)
            .map(percent_decode)
            .filter(|r| !r.is_empty())
    });
    let query_pairs: Vec<(String, String)> = req
        .uri()
        .query()
        .map(|query| {
            form_urlencoded::parse(query.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default();

    // Alternate encodings of `get` select sibling methods.
    if name == "dataset.get" {
        match query_pairs.iter().find(|(k, _)| k == "format").map(|(_, v)| v.as_str()) {
            Some("csv") => name = "dataset.getcsv".to_string(),
            Some("zip") => name = "dataset.getzip".to_string(),
            _ => {}
        }
    }

    // Multipart bodies carry file uploads; everything else is JSON.
    let is_multipart = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("multipart/form-data"))
        .unwrap_or(false);

    // Keeps uploaded files alive until dispatch completes.
    let mut upload_dir: Option<tempfile::TempDir> = None;

    let mut params = if is_multipart {
        match multipart_params(req, &mut upload_dir).await {
            Ok(params) => params,
            Err(err) => return ApiError(err).into_response(),
        }
    } else {
        match json_body_params(req).await {
            Ok(params) => params,
            Err(err) => return ApiError(err).into_response(),
        }
    };

    for (key, value) in query_pairs {
        if key == "format" && name != "sql.exec" {
            continue;
        }
        params.insert(key, coerce_scalar(&value));
    }
    if let Some(r) = path_ref {
        params.insert("ref".to_string(), Value::String(r));
    }

    debug!(method = %name, "http dispatch");
    let params = if params.is_empty() {
        Value::Null
    } else {
        Value::Object(params)
    };

    let outcome = match instance
        .dispatch_http(&name, params, token.as_deref(), "")
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => return ApiError(err).into_response(),
    };

    if RAW_METHODS.contains(&name.as_str()) {
        return match serde_json::from_value::<RawBytes>(outcome.value) {
            Ok(raw) => ([(CONTENT_TYPE, raw.content_type)], raw.body).into_response(),
            Err(err) => ApiError(Error::internal(format!("decoding raw result: {err}")))
                .into_response(),
        };
    }

    if wants_ndjson {
        return stream_ndjson(instance, name, token, outcome).await;
    }

    let mut body = json!({ "data": outcome.value });
    if let Some(cursor) = outcome.cursor {
        body["cursor"] = json!(cursor);
    }
    Json(body).into_response()
}

/// Iterate a paginated method to exhaustion, emitting one JSON line per
/// item.
async fn stream_ndjson(
    instance: Arc<Instance>,
    name: String,
    token: Option<String>,
    first: almanac_core::DispatchOutcome,
) -> Response {
    const MAX_PAGES: usize = 10_000;
    let mut lines = Vec::new();
    let mut outcome = first;
    for _ in 0..MAX_PAGES {
        match &outcome.value {
            Value::Array(items) => {
                for item in items {
                    lines.extend(item.to_string().into_bytes());
                    lines.push(b'\n');
                }
            }
            other => {
                lines.extend(other.to_string().into_bytes());
                lines.push(b'\n');
            }
        }
        let Some(cursor) = outcome.cursor.take() else {
            break;
        };
        outcome = match instance
            .dispatch_http(&name, cursor.next_params, token.as_deref(), "")
            .await
        {
            Ok(next) => next,
            Err(err) => return ApiError(err).into_response(),
        };
    }
    (
        [(CONTENT_TYPE, "application/x-ndjson")],
        Body::from(lines),
    )
        .into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

async fn json_body_params(req: Request) -> Result<Map<String, Value>, Error> {
    let bytes = axum::body::to_bytes(req.into_body(), 32 * 1024 * 1024)
        .await
        .map_err(|e| Error::validation(format!("reading request body: {e}")))?;
    if bytes.is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(Error::validation("request body must be a JSON object")),
        Err(e) => Err(Error::validation(format!("invalid json body: {e}"))),
    }
}

/// Decode a multipart form: text fields become params, the `body` file
/// becomes `bodyPath`, and `file` uploads become `filePaths`.
async fn multipart_params(
    req: Request,
    upload_dir: &mut Option<tempfile::TempDir>,
) -> Result<Map<String, Value>, Error> {
    let mut multipart = Multipart::from_request(req, &())
        .await
        .map_err(|e| Error::validation(format!("invalid multipart body: {e}")))?;
    let dir = tempfile::tempdir()
        .map_err(|e| Error::internal(format!("creating upload dir: {e}")))?;

    let mut params = Map::new();
    let mut file_paths = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::validation(format!("invalid multipart body: {e}")))?
    {
        let field_name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        match (field_name.as_str(), file_name) {
            ("body", Some(file_name)) | ("file", Some(file_name)) => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| Error::validation(format!("reading upload: {e}")))?;
                let safe_name = std::path::Path::new(&file_name)
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("upload")
                    .to_string();
                let path = dir.path().join(&safe_name);
                std::fs::write(&path, &data)
                    .map_err(|e| Error::internal(format!("storing upload: {e}")))?;
                let path = path.to_string_lossy().into_owned();
                if field_name == "body" {
                    params.insert("bodyPath".to_string(), Value::String(path));
                } else {
                    file_paths.push(Value::String(path));
                }
            }
            ("dataset", _) => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| Error::validation(format!("reading field: {e}")))?;
                let value: Value = serde_json::from_str(&text)
                    .map_err(|e| Error::validation(format!("dataset field: {e}")))?;
                params.insert("dataset".to_string(), value);
            }
            (_, _) => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| Error::validation(format!("reading field: {e}")))?;
                params.insert(field_name, coerce_scalar(&text));
            }
        }
    }
    if !file_paths.is_empty() {
        params.insert("filePaths".to_string(), Value::Array(file_paths));
    }
    *upload_dir = Some(dir);
    Ok(params)
}

/// Query-string and form values arrive as strings; params expect JSON
/// scalars.
fn coerce_scalar(raw: &str) -> Value {
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = raw.parse::<i64>() {
        return json!(n);
    }
    Value::String(raw.to_string())
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(
                std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or(""),
                16,
            ) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Fallback for unknown routes: a 404 with the standard error body.
pub async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "not found", "kind": "not-found" })),
    )
        .into_response()
}
