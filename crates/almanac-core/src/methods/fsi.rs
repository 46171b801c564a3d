//! Filesystem workspace methods: init, checkout, write, status.

use std::path::{Path, PathBuf};

use almanac_events::EventType;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::dataset::{Dataset, Meta, Structure, FORMAT_CSV, FORMAT_JSON};
use crate::dispatch::{AttributeSet, Dispatcher, MethodParams};
use crate::error::Error;
use crate::fsi::{self, StatusItem};
use crate::methods::substitute_me_ref;
use crate::refs::{validate_name, Ref};
use crate::scope::Scope;

pub fn register(d: &mut Dispatcher) {
    d.register("fsi.init", AttributeSet::post("/init/{ref...}"), init);
    d.register("fsi.checkout", AttributeSet::post("/checkout/{ref...}"), checkout);
    d.register("fsi.write", AttributeSet::post("/fsi/write/{ref...}"), write);
    d.register("fsi.status", AttributeSet::post("/status/{ref...}"), status);
}

// ── Init ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InitParams {
    /// Over HTTP the new ref arrives in the route path; `name` falls back
    /// to its name segment.
    #[serde(rename = "ref")]
    pub reference: String,
    pub name: String,
    pub target_dir: String,
    pub format: String,
}

impl Default for InitParams {
    fn default() -> Self {
        Self {
            reference: String::new(),
            name: String::new(),
            target_dir: String::new(),
            format: FORMAT_CSV.to_string(),
        }
    }
}

impl MethodParams for InitParams {
    fn set_nonzero_defaults(&mut self) {
        if self.format.is_empty() {
            self.format = FORMAT_CSV.to_string();
        }
        if self.name.is_empty() {
            if let Some((_, name)) = self.reference.split_once('/') {
                self.name = name.to_string();
            }
        }
    }

    fn validate(&self) -> Result<(), Error> {
        validate_name(&self.name).map_err(|e| e.context("dataset name"))?;
        if self.target_dir.is_empty() {
            return Err(Error::validation("target directory is required"));
        }
        if self.format != FORMAT_CSV && self.format != FORMAT_JSON {
            return Err(Error::validation(format!(
                "unsupported workspace format {:?}",
                self.format
            )));
        }
        Ok(())
    }
}

/// Create a workspace linking a new ref to a directory. The directory is
/// created when missing; on failure every directory this call created is
/// removed again.
pub async fn init(scope: Scope, params: InitParams) -> Result<Ref, Error> {
    let r = Ref::new(scope.active_username(), &params.name);
    let target = PathBuf::from(&params.target_dir);

    let created = fsi::create_dirs_tracked(&target)?;
    let result = init_inner(&scope, &r, &target, &params.format).await;
    if result.is_err() {
        fsi::remove_created_dirs(&created);
    }
    result?;

    scope
        .publish(
            EventType::WorkspaceInit,
            json!({ "ref": r.alias(), "dir": params.target_dir }),
        )
        .await;
    Ok(r)
}

async fn init_inner(
    scope: &Scope,
    r: &Ref,
    target: &Path,
    format: &str,
) -> Result<(), Error> {
    if target.join(fsi::LINK_FILE).exists() {
        return Err(Error::conflict(format!(
            "directory {} is already linked to a dataset",
            target.display()
        )));
    }
    // Registers the name; fails when the ref already has a log.
    scope.logbook().write_init(r)?;

    let starter = starter_dataset(&r.name, format);
    fsi::write_components(&starter, target)?;
    scope.fsi().create_link(&r.alias(), target)?;
    scope.dscache().persist()?;
    Ok(())
}

fn starter_dataset(name: &str, format: &str) -> Dataset {
    let (body, schema, length) = if format == FORMAT_CSV {
        let body = json!([["one", 1], ["two", 2]]);
        let schema = json!({
            "type": "array",
            "items": {"type": "array", "items": [{"title": "title"}, {"title": "count"}]},
        });
        (body, Some(schema), 24)
    } else {
        (json!([]), None, 2)
    };
    Dataset {
        meta: Some(Meta {
            title: name.to_string(),
            ..Default::default()
        }),
        structure: Some(Structure {
            format: format.to_string(),
            schema,
            entries: body.as_array().map(|r| r.len() as u64).unwrap_or_default(),
            length,
        }),
        body: Some(body),
        ..Default::default()
    }
}

// ── Checkout ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CheckoutParams {
    #[serde(rename = "ref")]
    pub reference: String,
    pub dir: String,
}

impl MethodParams for CheckoutParams {
    fn validate(&self) -> Result<(), Error> {
        if self.reference.is_empty() {
            return Err(Error::validation("ref is required"));
        }
        if self.dir.is_empty() {
            return Err(Error::validation("checkout directory is required"));
        }
        if !Path::new(&self.dir).is_absolute() {
            return Err(Error::validation("checkout directory must be absolute"));
        }
        Ok(())
    }

    fn substitute_me(&mut self, active_username: &str) {
        substitute_me_ref(&mut self.reference, active_username);
    }
}

/// Materialise the resolved version into `dir` and record the link.
pub async fn checkout(scope: Scope, params: CheckoutParams) -> Result<(), Error> {
    let ds = scope
        .loader()
        .load_dataset(scope.ctx(), &params.reference, "")
        .await?;
    let alias = format!("{}/{}", ds.username, ds.name);
    let dir = PathBuf::from(&params.dir);

    let created = fsi::create_dirs_tracked(&dir)?;
    let result = (|| -> Result<(), Error> {
        if dir.join(fsi::LINK_FILE).exists() {
            return Err(Error::conflict(format!(
                "directory {} is already linked to a dataset",
                dir.display()
            )));
        }
        fsi::write_components(&ds, &dir)?;
        scope.fsi().create_link(&alias, &dir)?;
        scope.dscache().persist()?;
        Ok(())
    })();
    if result.is_err() {
        fsi::remove_created_dirs(&created);
    }
    result?;

    scope
        .publish(
            EventType::WorkspaceCheckout,
            json!({ "ref": alias, "dir": params.dir }),
        )
        .await;
    Ok(())
}

// ── Write ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WriteParams {
    #[serde(rename = "ref")]
    pub reference: String,
    pub dataset: Option<Dataset>,
}

impl MethodParams for WriteParams {
    fn validate(&self) -> Result<(), Error> {
        if self.reference.is_empty() {
            return Err(Error::validation("ref is required"));
        }
        if self.dataset.is_none() {
            return Err(Error::validation("dataset is required"));
        }
        Ok(())
    }

    fn substitute_me(&mut self, active_username: &str) {
        substitute_me_ref(&mut self.reference, active_username);
    }
}

/// Merge component values into a linked workspace, returning the resulting
/// per-component status.
pub async fn write(scope: Scope, params: WriteParams) -> Result<Vec<StatusItem>, Error> {
    let r = Ref::parse_relaxed(&params.reference)?;
    let alias = r.alias();
    let dir = scope.fsi().linked_dir(&alias).ok_or_else(|| {
        Error::validation(format!("dataset {alias} is not linked to a working directory"))
    })?;

    let incoming = params.dataset.expect("validated non-nil");
    fsi::write_components(&incoming, &dir)?;
    scope
        .publish(EventType::WorkspaceWrite, json!({ "ref": alias }))
        .await;

    let stored = stored_version(&scope, &alias)?;
    scope.fsi().status(stored.as_ref(), &dir)
}

// ── Status ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StatusParams {
    /// A dataset ref, or a path to a linked working directory.
    #[serde(rename = "ref")]
    pub ref_or_dir: String,
}

impl MethodParams for StatusParams {
    fn validate(&self) -> Result<(), Error> {
        if self.ref_or_dir.is_empty() {
            return Err(Error::validation("a ref or working directory is required"));
        }
        Ok(())
    }

    fn substitute_me(&mut self, active_username: &str) {
        if !self.ref_or_dir.starts_with('/') {
            substitute_me_ref(&mut self.ref_or_dir, active_username);
        }
    }
}

/// Per-component working-directory status.
pub async fn status(scope: Scope, params: StatusParams) -> Result<Vec<StatusItem>, Error> {
    let (alias, dir) = if params.ref_or_dir.starts_with('/') {
        let dir = PathBuf::from(&params.ref_or_dir);
        let alias = scope.fsi().alias_for_dir(&dir)?;
        (alias, dir)
    } else {
        let r = Ref::parse_relaxed(&params.ref_or_dir)?;
        let alias = r.alias();
        let dir = scope.fsi().linked_dir(&alias).ok_or_else(|| {
            Error::validation(format!(
                "dataset {alias} is not linked to a working directory"
            ))
        })?;
        (alias, dir)
    };

    let stored = stored_version(&scope, &alias)?;
    scope.fsi().status(stored.as_ref(), &dir)
}

fn stored_version(scope: &Scope, alias: &str) -> Result<Option<Dataset>, Error> {
    match scope.repo().resolve_alias(alias) {
        Some(info) if !info.path.is_empty() && scope.repo().has_path(&info.path) => {
            Ok(Some(scope.repo().get_dataset(&info.path)?))
        }
        _ => Ok(None),
    }
}
