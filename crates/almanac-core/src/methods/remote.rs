//! Remote sync methods: push, pull, preview.

use almanac_events::EventType;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::dispatch::{AttributeSet, Dispatcher, MethodParams};
use crate::error::Error;
use crate::loader::{SOURCE_LOCAL, SOURCE_NETWORK};
use crate::methods::dataset::{pull as dataset_pull, PullParams};
use crate::methods::substitute_me_ref;
use crate::refs::Ref;
use crate::registry::Preview;
use crate::scope::Scope;

pub fn register(d: &mut Dispatcher) {
    d.register("remote.push", AttributeSet::post("/push/{ref...}"), push);
    d.register(
        "remote.pull",
        AttributeSet::post("/pull/{ref...}").with_default_source(SOURCE_NETWORK),
        pull,
    );
    d.register("remote.preview", AttributeSet::get("/preview/{ref...}"), preview);
}

/// Resolve a remote name or address: named remotes from config first, then
/// the literal address, then the configured registry.
fn remote_location(scope: &Scope, remote: &str) -> Result<String, Error> {
    if !remote.is_empty() {
        if let Some(addr) = scope.config().remotes.get(remote) {
            return Ok(addr.clone());
        }
        return Ok(remote.to_string());
    }
    scope
        .config()
        .registry
        .location
        .clone()
        .ok_or_else(|| Error::validation("no remote specified and no registry configured"))
}

// ── Push ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PushParams {
    #[serde(rename = "ref")]
    pub reference: String,
    /// Remote name from config, or a literal address.
    pub remote: String,
}

impl MethodParams for PushParams {
    fn validate(&self) -> Result<(), Error> {
        if self.reference.is_empty() {
            return Err(Error::validation("ref is required"));
        }
        Ok(())
    }

    fn substitute_me(&mut self, active_username: &str) {
        substitute_me_ref(&mut self.reference, active_username);
    }
}

pub async fn push(scope: Scope, params: PushParams) -> Result<Value, Error> {
    let location = remote_location(&scope, &params.remote)?;
    let ds = scope
        .loader()
        .load_dataset(scope.ctx(), &params.reference, SOURCE_LOCAL)
        .await
        .map_err(|e| e.context("push"))?;
    let r = Ref::new(&ds.username, &ds.name).with_path(&ds.path);

    scope
        .publish(
            EventType::PushStarted,
            json!({ "ref": r.to_string(), "location": location }),
        )
        .await;
    scope
        .remote()
        .push_dataset(scope.ctx(), &r, &ds, &location)
        .await
        .map_err(|e| e.context(&format!("pushing {}", r.alias())))?;
    scope.logbook().write_push(&r, &location)?;
    info!(r = %r, location = %location, "pushed dataset");
    scope
        .publish(
            EventType::PushCompleted,
            json!({ "ref": r.to_string(), "location": location }),
        )
        .await;
    Ok(json!({ "ref": r.to_string(), "location": location }))
}

// ── Pull ─────────────────────────────────────────────────────────────────

/// Thin delegation to `dataset.pull`; registered separately so the HTTP
/// route and the in-process method share one implementation.
pub async fn pull(scope: Scope, params: PullParams) -> Result<Value, Error> {
    dataset_pull(scope, params).await
}

// ── Preview ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PreviewParams {
    #[serde(rename = "ref")]
    pub reference: String,
    pub remote: String,
}

impl MethodParams for PreviewParams {
    fn validate(&self) -> Result<(), Error> {
        if self.reference.is_empty() {
            return Err(Error::validation("ref is required"));
        }
        Ok(())
    }

    fn substitute_me(&mut self, active_username: &str) {
        substitute_me_ref(&mut self.reference, active_username);
    }
}

/// Fetch a version summary and readme excerpt without pulling blocks.
pub async fn preview(scope: Scope, params: PreviewParams) -> Result<Preview, Error> {
    let r = Ref::parse_relaxed(&params.reference)?;
    let location = remote_location(&scope, &params.remote)?;
    scope
        .remote()
        .preview(scope.ctx(), &r, &location)
        .await
        .map_err(|e| e.context("preview"))
}
