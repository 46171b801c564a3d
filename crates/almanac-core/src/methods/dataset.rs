//! The dataset method group: save, get (plus CSV/zip encodings), diff,
//! remove, rename, pull, validate, and stats.

use std::io::Write as _;

use almanac_events::EventType;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;
use zip::write::SimpleFileOptions;

use crate::dataset::{
    self, Commit, Dataset, Meta, Readme, Structure, Transform, Viz, FORMAT_CSV, FORMAT_JSON,
};
use crate::diff::{diff_values, DiffResponse};
use crate::dispatch::{AttributeSet, Dispatcher, MethodParams};
use crate::error::Error;
use crate::fsi;
use crate::loader::SOURCE_NETWORK;
use crate::methods::{substitute_me_ref, validate_selector, RawBytes};
use crate::refs::{validate_name, Ref, VersionInfo};
use crate::schema::{validate_schema, SchemaIssue};
use crate::scope::Scope;
use crate::stats::column_stats;

pub fn register(d: &mut Dispatcher) {
    d.register("dataset.get", AttributeSet::get("/get/{ref...}"), get);
    d.register("dataset.getcsv", AttributeSet::unrouted(), get_csv);
    d.register("dataset.getzip", AttributeSet::unrouted(), get_zip);
    d.register("dataset.save", AttributeSet::post("/save"), save);
    d.register("dataset.diff", AttributeSet::post("/diff"), diff);
    d.register("dataset.remove", AttributeSet::post("/remove"), remove);
    d.register("dataset.rename", AttributeSet::post("/rename"), rename);
    d.register(
        "dataset.pull",
        AttributeSet::unrouted().with_default_source(SOURCE_NETWORK),
        pull,
    );
    d.register("dataset.validate", AttributeSet::post("/validate"), validate);
    d.register("dataset.stats", AttributeSet::get("/stats/{ref...}"), stats);
}

// ── Get ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GetParams {
    #[serde(rename = "ref")]
    pub reference: String,
    /// Dotted path into the dataset tree; `body` supports pagination.
    pub selector: String,
    pub limit: i64,
    pub offset: i64,
    pub all: bool,
    pub source: String,
}

impl MethodParams for GetParams {
    fn set_nonzero_defaults(&mut self) {
        if self.limit == 0 {
            self.limit = 100;
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.reference.is_empty() {
            return Err(Error::validation("ref is required"));
        }
        if !self.selector.is_empty() {
            validate_selector(&self.selector)?;
        }
        Ok(())
    }

    fn source(&self) -> Option<&str> {
        Some(&self.source)
    }

    fn set_source(&mut self, source: &str) {
        self.source = source.to_string();
    }

    fn substitute_me(&mut self, active_username: &str) {
        substitute_me_ref(&mut self.reference, active_username);
    }
}

/// The whole dataset document, or the subtree named by the selector.
pub async fn get(scope: Scope, params: GetParams) -> Result<Value, Error> {
    let ds = scope
        .loader()
        .load_dataset(scope.ctx(), &params.reference, &params.source)
        .await?;

    if params.selector.is_empty() {
        return Ok(serde_json::to_value(&ds)?);
    }

    if params.selector == "body" {
        let rows = ds.body_rows()?;
        let page = paginate_body(&scope, &ds, rows, &params)?;
        return Ok(Value::Array(page));
    }

    let tree = serde_json::to_value(&ds)?;
    let mut node = &tree;
    for segment in params.selector.split('.') {
        node = node.get(segment).ok_or_else(|| {
            Error::not_found(format!("selector not found: {}", params.selector))
        })?;
    }
    Ok(node.clone())
}

fn paginate_body(
    scope: &Scope,
    ds: &Dataset,
    rows: &[Value],
    params: &GetParams,
) -> Result<Vec<Value>, Error> {
    if params.all {
        let max = scope.config().limits.max_body_size_to_get_all;
        let size = ds.structure.as_ref().map(|s| s.length).unwrap_or_default();
        if size > max {
            return Err(Error::validation(format!(
                "body is too large to get all: {size} larger than {max}"
            )));
        }
        return Ok(rows.to_vec());
    }
    if params.limit < 0 || params.offset < 0 {
        return Err(Error::validation("invalid limit / offset settings"));
    }
    Ok(rows
        .iter()
        .skip(params.offset as usize)
        .take(params.limit as usize)
        .cloned()
        .collect())
}

/// Body as CSV bytes.
pub async fn get_csv(scope: Scope, params: GetParams) -> Result<RawBytes, Error> {
    let ds = scope
        .loader()
        .load_dataset(scope.ctx(), &params.reference, &params.source)
        .await?;
    let rows = ds.body_rows()?;
    let page = paginate_body(&scope, &ds, rows, &params)?;
    let schema = ds.structure.as_ref().and_then(|s| s.schema.as_ref());
    Ok(RawBytes {
        content_type: "text/csv".to_string(),
        body: dataset::encode_csv(&page, schema)?,
    })
}

/// The whole version as a zip archive: component documents, the body in its
/// native encoding, and a `ref.txt` naming the pinned ref.
pub async fn get_zip(scope: Scope, params: GetParams) -> Result<RawBytes, Error> {
    let ds = scope
        .loader()
        .load_dataset(scope.ctx(), &params.reference, &params.source)
        .await?;

    let zip_err = |e: zip::result::ZipError| Error::internal(format!("writing zip: {e}"));
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();

    let put = |writer: &mut zip::ZipWriter<std::io::Cursor<Vec<u8>>>,
                   name: &str,
                   data: &[u8]|
     -> Result<(), Error> {
        writer.start_file(name, options).map_err(zip_err)?;
        writer
            .write_all(data)
            .map_err(|e| Error::internal(format!("writing zip entry {name}: {e}")))?;
        Ok(())
    };

    if let Some(commit) = &ds.commit {
        put(&mut writer, "commit.json", &serde_json::to_vec_pretty(commit)?)?;
    }
    if let Some(meta) = &ds.meta {
        put(&mut writer, "meta.json", &serde_json::to_vec_pretty(meta)?)?;
    }
    if let Some(structure) = &ds.structure {
        put(
            &mut writer,
            "structure.json",
            &serde_json::to_vec_pretty(structure)?,
        )?;
    }
    if let Some(body) = &ds.body {
        let format = ds
            .structure
            .as_ref()
            .map(|s| s.format.as_str())
            .unwrap_or(FORMAT_JSON);
        if format == FORMAT_CSV {
            let rows = body.as_array().cloned().unwrap_or_default();
            let schema = ds.structure.as_ref().and_then(|s| s.schema.as_ref());
            put(&mut writer, "body.csv", &dataset::encode_csv(&rows, schema)?)?;
        } else {
            put(&mut writer, "body.json", &serde_json::to_vec_pretty(body)?)?;
        }
    }
    let pinned = format!("{}/{}@{}\n", ds.username, ds.name, ds.path);
    put(&mut writer, "ref.txt", pinned.as_bytes())?;

    let cursor = writer.finish().map_err(zip_err)?;
    Ok(RawBytes {
        content_type: "application/zip".to_string(),
        body: cursor.into_inner(),
    })
}

// ── Save ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SaveParams {
    #[serde(rename = "ref")]
    pub reference: String,
    /// Inline dataset document; merged over the previous version.
    pub dataset: Option<Dataset>,
    /// Path to a body file (`.csv` or `.json`).
    pub body_path: String,
    /// Paths to component files (`meta.json`, `structure.json`,
    /// `readme.md`, `transform.*`, `viz.*`).
    pub file_paths: Vec<String>,
    pub title: String,
    pub message: String,
    /// Allow a commit with no changes.
    pub force: bool,
    /// Run the transform while saving.
    pub apply: bool,
    pub private: bool,
}

impl MethodParams for SaveParams {
    fn validate(&self) -> Result<(), Error> {
        if self.private {
            return Err(Error::validation("private datasets are not yet implemented"));
        }
        if self.reference.is_empty() {
            return Err(Error::validation("ref is required"));
        }
        Ok(())
    }

    fn substitute_me(&mut self, active_username: &str) {
        substitute_me_ref(&mut self.reference, active_username);
    }
}

/// Materialise a new dataset version.
pub async fn save(scope: Scope, params: SaveParams) -> Result<Dataset, Error> {
    let r = Ref::parse(&params.reference)?;
    let alias = r.alias();

    // Saves for one ref serialise through the logbook's per-ref lock.
    let _guard = scope.logbook().lock_ref(&alias).await;
    scope
        .publish(EventType::SaveStarted, json!({ "ref": alias }))
        .await;

    let previous = match scope.repo().resolve_alias(&alias) {
        Some(info) => Some(scope.repo().get_dataset(&info.path)?),
        None => None,
    };

    let mut next = previous.clone().unwrap_or_default();
    next.commit = None;
    next.username = String::new();
    next.name = String::new();
    next.path = String::new();

    if let Some(inline) = &params.dataset {
        merge_components(&mut next, inline);
    }
    for path in &params.file_paths {
        apply_component_file(&mut next, std::path::Path::new(path))?;
    }
    if !params.body_path.is_empty() {
        let path = std::path::Path::new(&params.body_path);
        let format = dataset::format_from_extension(path)?;
        let bytes = std::fs::read(path)
            .map_err(|e| Error::validation(format!("body file: {}: {e}", path.display())))?;
        let body = dataset::decode_body(format, &bytes)?;
        let mut structure = next.structure.take().unwrap_or_default();
        structure.format = body.format.clone();
        structure.entries = body.entries();
        structure.length = body.length;
        if body.schema.is_some() {
            structure.schema = body.schema.clone();
        }
        next.structure = Some(structure);
        next.body = Some(body.rows);
    } else if next.body.is_some() {
        refresh_structure(&mut next)?;
    }

    if params.apply && next.transform.is_none() {
        return Err(Error::validation(
            "cannot apply while saving without a transform",
        ));
    }

    match &previous {
        Some(prev) => {
            if !params.force && next.change_signature() == prev.change_signature() {
                return Err(Error::conflict("no changes to save"));
            }
        }
        None => {
            if next.is_empty() && !params.force {
                return Err(Error::validation("no changes to save"));
            }
        }
    }

    scope
        .publish(EventType::SaveProgress, json!({ "ref": alias }))
        .await;

    let title = if !params.title.is_empty() {
        params.title.clone()
    } else if previous.is_none() {
        "created dataset".to_string()
    } else {
        "updated dataset".to_string()
    };
    next.commit = Some(Commit {
        title: title.clone(),
        message: params.message.clone(),
        timestamp: Some(scope.clock().now()),
    });

    let path = scope.repo().put_dataset(&next)?;
    if !scope.logbook().has_ref(&alias) {
        scope.logbook().write_init(&r)?;
    }
    scope.logbook().write_commit(&r, &path, &title)?;

    let info = VersionInfo {
        username: r.username.clone(),
        name: r.name.clone(),
        profile_id: Some(scope.profile().id.clone()),
        path: path.clone(),
        commit_title: title,
        commit_message: params.message.clone(),
        commit_time: next.commit.as_ref().and_then(|c| c.timestamp),
        body_size: next.structure.as_ref().map(|s| s.length).unwrap_or_default(),
        body_rows: next
            .structure
            .as_ref()
            .map(|s| s.entries)
            .unwrap_or_default(),
        ..Default::default()
    };
    scope.repo().put_ref(info.clone())?;
    scope.dscache().update(info);

    // Keep a linked working directory in sync with the new version.
    if let Some(dir) = scope.fsi().linked_dir(&alias) {
        fsi::write_components(&next, &dir)?;
    }

    info!(r = %alias, path = %path, "saved dataset version");
    scope
        .publish(EventType::SaveCompleted, json!({ "ref": alias, "path": path }))
        .await;
    Ok(next.with_ref(&r.username, &r.name, &path))
}

fn merge_components(target: &mut Dataset, inline: &Dataset) {
    if inline.meta.is_some() {
        target.meta = inline.meta.clone();
    }
    if inline.structure.is_some() {
        target.structure = inline.structure.clone();
    }
    if inline.readme.is_some() {
        target.readme = inline.readme.clone();
    }
    if inline.transform.is_some() {
        target.transform = inline.transform.clone();
    }
    if inline.viz.is_some() {
        target.viz = inline.viz.clone();
    }
    if inline.body.is_some() {
        target.body = inline.body.clone();
    }
}

fn apply_component_file(target: &mut Dataset, path: &std::path::Path) -> Result<(), Error> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let read = || {
        std::fs::read(path)
            .map_err(|e| Error::validation(format!("component file {}: {e}", path.display())))
    };
    let read_text = || {
        std::fs::read_to_string(path)
            .map_err(|e| Error::validation(format!("component file {}: {e}", path.display())))
    };
    match file_name {
        "meta.json" => {
            let meta: Meta = serde_json::from_slice(&read()?)
                .map_err(|e| Error::validation(format!("meta.json: {e}")))?;
            target.meta = Some(meta);
        }
        "structure.json" => {
            let structure: Structure = serde_json::from_slice(&read()?)
                .map_err(|e| Error::validation(format!("structure.json: {e}")))?;
            target.structure = Some(structure);
        }
        "readme.md" => {
            target.readme = Some(Readme { text: read_text()? });
        }
        name if name.starts_with("transform.") => {
            target.transform = Some(Transform { script: read_text()? });
        }
        name if name.starts_with("viz.") => {
            target.viz = Some(Viz { script: read_text()? });
        }
        other => {
            return Err(Error::validation(format!(
                "unknown component file {other:?}"
            )))
        }
    }
    Ok(())
}

/// Recompute structure entries/length for an inline JSON body.
fn refresh_structure(next: &mut Dataset) -> Result<(), Error> {
    let body = next.body.as_ref().expect("caller checked body presence");
    let length = serde_json::to_vec(body)?.len() as u64;
    let entries = body.as_array().map(|rows| rows.len() as u64).unwrap_or(1);
    let mut structure = next.structure.take().unwrap_or_default();
    if structure.format.is_empty() {
        structure.format = FORMAT_JSON.to_string();
    }
    structure.entries = entries;
    structure.length = length;
    next.structure = Some(structure);
    Ok(())
}

// ── Diff ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DiffParams {
    pub left_side: String,
    pub right_side: String,
    pub selector: String,
    /// Compare the left ref against its own previous version.
    pub use_left_prev_version: bool,
    /// Compare the left ref against a working directory.
    pub working_dir: String,
}

impl MethodParams for DiffParams {
    fn validate(&self) -> Result<(), Error> {
        if self.use_left_prev_version && !self.working_dir.is_empty() {
            return Err(Error::validation(
                "cannot use previous version and working directory",
            ));
        }
        if !self.right_side.is_empty() && !self.working_dir.is_empty() {
            return Err(Error::validation(
                "cannot use working directory when comparing two sources",
            ));
        }
        if !self.right_side.is_empty() && self.use_left_prev_version {
            return Err(Error::validation(
                "cannot use previous version when comparing two sources",
            ));
        }
        let two_sides = !self.left_side.is_empty() && !self.right_side.is_empty();
        let one_side_mode = !self.left_side.is_empty()
            && (self.use_left_prev_version || !self.working_dir.is_empty());
        if !two_sides && !one_side_mode {
            return Err(Error::validation("invalid parameters to diff"));
        }
        if !self.selector.is_empty() {
            validate_selector(&self.selector)?;
        }
        Ok(())
    }

    fn substitute_me(&mut self, active_username: &str) {
        substitute_me_ref(&mut self.left_side, active_username);
        substitute_me_ref(&mut self.right_side, active_username);
    }
}

pub async fn diff(scope: Scope, params: DiffParams) -> Result<DiffResponse, Error> {
    let (left, right) = if !params.working_dir.is_empty() {
        let stored = load_for_diff(&scope, &params.left_side).await?;
        let working =
            fsi::read_dir_dataset(std::path::Path::new(&params.working_dir))?;
        (stored, working)
    } else if params.use_left_prev_version || params.left_side == params.right_side {
        // Identical sides mean "compare with the previous version".
        let current = load_for_diff(&scope, &params.left_side).await?;
        let previous = load_previous(&scope, &params.left_side).await?;
        (previous, current)
    } else {
        let left = load_for_diff(&scope, &params.left_side).await?;
        let right = load_for_diff(&scope, &params.right_side).await?;
        (left, right)
    };

    let left_value = diffable_value(&left, &params.selector)?;
    let right_value = diffable_value(&right, &params.selector)?;
    Ok(diff_values(&left_value, &right_value))
}

async fn load_for_diff(scope: &Scope, refstr: &str) -> Result<Dataset, Error> {
    scope
        .loader()
        .load_dataset(scope.ctx(), refstr, "")
        .await
        .map_err(|e| e.context("diff"))
}

async fn load_previous(scope: &Scope, refstr: &str) -> Result<Dataset, Error> {
    let r = Ref::parse_relaxed(refstr)?;
    let versions = scope
        .logbook()
        .versions_for(&r.alias())
        .unwrap_or_default();
    let previous = versions
        .get(1)
        .ok_or_else(|| Error::not_found(format!("dataset {} has no previous version", r.alias())))?;
    scope
        .loader()
        .load_dataset(
            scope.ctx(),
            &format!("{}@{}", r.alias(), previous.path),
            "",
        )
        .await
}

fn diffable_value(ds: &Dataset, selector: &str) -> Result<Value, Error> {
    let mut stripped = ds.clone();
    stripped.username = String::new();
    stripped.name = String::new();
    stripped.path = String::new();
    let tree = serde_json::to_value(&stripped)?;
    if selector.is_empty() {
        return Ok(tree);
    }
    let mut node = &tree;
    for segment in selector.split('.') {
        node = node
            .get(segment)
            .ok_or_else(|| Error::not_found(format!("selector not found: {selector}")))?;
    }
    Ok(node.clone())
}

// ── Remove ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RemoveParams {
    #[serde(rename = "ref")]
    pub reference: String,
    /// How many versions to delete; -1 deletes the whole dataset.
    pub revisions: i64,
    /// A component selector is rejected: only whole versions are removed.
    pub selector: String,
    /// Keep workspace files on full removal.
    pub keep_files: bool,
}

impl Default for RemoveParams {
    fn default() -> Self {
        Self {
            reference: String::new(),
            revisions: -1,
            selector: String::new(),
            keep_files: false,
        }
    }
}

impl MethodParams for RemoveParams {
    fn validate(&self) -> Result<(), Error> {
        if self.reference.is_empty() {
            return Err(Error::validation("ref is required"));
        }
        if !self.selector.is_empty() {
            return Err(Error::validation(
                "can only remove whole dataset versions, not individual components",
            ));
        }
        if self.revisions == 0 {
            return Err(Error::validation("revisions to remove must not be zero"));
        }
        Ok(())
    }

    fn substitute_me(&mut self, active_username: &str) {
        substitute_me_ref(&mut self.reference, active_username);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveResponse {
    /// -1 when the whole dataset was removed.
    pub num_deleted: i64,
    pub unlinked: bool,
}

pub async fn remove(scope: Scope, params: RemoveParams) -> Result<RemoveResponse, Error> {
    let r = Ref::parse_relaxed(&params.reference)?;
    let alias = r.alias();
    let _guard = scope.logbook().lock_ref(&alias).await;

    let versions = scope
        .logbook()
        .versions_for(&alias)
        .ok_or_else(|| Error::not_found(format!("reference not found: {alias}")))?;

    let remove_all = params.revisions < 0 || params.revisions as usize >= versions.len();
    let dropped: Vec<&VersionInfo> = if remove_all {
        versions.iter().collect()
    } else {
        versions.iter().take(params.revisions as usize).collect()
    };
    for version in &dropped {
        if !version.path.is_empty() {
            scope.repo().delete_blob(&version.path)?;
        }
    }

    scope
        .logbook()
        .write_delete(&r, if remove_all { -1 } else { params.revisions })?;

    let mut unlinked = false;
    if remove_all {
        if !params.keep_files {
            unlinked = scope.fsi().unlink(&alias)?;
        }
        scope.repo().delete_ref(&alias)?;
        scope.dscache().remove(&alias);
        if unlinked {
            scope
                .publish(EventType::WorkspaceUnlink, json!({ "ref": alias }))
                .await;
        }
    } else if let Some(latest) = scope.logbook().resolve(&alias) {
        let mut info = scope
            .repo()
            .resolve_alias(&alias)
            .unwrap_or_else(|| VersionInfo {
                username: r.username.clone(),
                name: r.name.clone(),
                ..Default::default()
            });
        info.path = latest;
        scope.repo().put_ref(info.clone())?;
        scope.dscache().update(info);
    }

    Ok(RemoveResponse {
        num_deleted: if remove_all { -1 } else { params.revisions },
        unlinked,
    })
}

// ── Rename ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RenameParams {
    pub current: String,
    pub next: String,
}

impl MethodParams for RenameParams {
    fn validate(&self) -> Result<(), Error> {
        if self.current.is_empty() || self.next.is_empty() {
            return Err(Error::validation("both current and next names are required"));
        }
        Ok(())
    }

    fn substitute_me(&mut self, active_username: &str) {
        substitute_me_ref(&mut self.current, active_username);
        substitute_me_ref(&mut self.next, active_username);
    }
}

pub async fn rename(scope: Scope, params: RenameParams) -> Result<Ref, Error> {
    let current = Ref::parse_relaxed(&params.current)?;
    let next = if params.next.contains('/') {
        Ref::parse(&params.next)?
    } else {
        validate_name(&params.next)?;
        Ref::new(&current.username, &params.next)
    };

    let alias = current.alias();
    let _guard = scope.logbook().lock_ref(&alias).await;

    if !scope.logbook().has_ref(&alias) && scope.repo().resolve_alias(&alias).is_none() {
        return Err(Error::not_found(format!("reference not found: {alias}")));
    }
    if scope.repo().resolve_alias(&next.alias()).is_some()
        || scope.logbook().has_ref(&next.alias())
    {
        return Err(Error::conflict(format!(
            "dataset {} already exists",
            next.alias()
        )));
    }

    scope.logbook().write_rename(&current, &next)?;
    scope.repo().rename_ref(&alias, &next.username, &next.name)?;
    scope.dscache().rename(&alias, &next.username, &next.name);
    info!(from = %alias, to = %next.alias(), "renamed dataset");
    Ok(next)
}

// ── Pull ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PullParams {
    #[serde(rename = "ref")]
    pub reference: String,
    pub source: String,
    /// Fetch only the history oplog, without blocks.
    pub logs_only: bool,
}

impl MethodParams for PullParams {
    fn validate(&self) -> Result<(), Error> {
        if self.reference.is_empty() {
            return Err(Error::validation("ref is required"));
        }
        Ok(())
    }

    fn source(&self) -> Option<&str> {
        Some(&self.source)
    }

    fn set_source(&mut self, source: &str) {
        self.source = source.to_string();
    }

    fn substitute_me(&mut self, active_username: &str) {
        substitute_me_ref(&mut self.reference, active_username);
    }
}

pub async fn pull(scope: Scope, params: PullParams) -> Result<Value, Error> {
    if params.logs_only {
        let mut r = Ref::parse_relaxed(&params.reference)?;
        let location = scope
            .loader()
            .resolve_ref(scope.ctx(), &mut r, &params.source)
            .await?;
        scope
            .publish(EventType::PullStarted, json!({ "ref": r.alias(), "logsOnly": true }))
            .await;
        let ops = scope
            .remote()
            .pull_logs(scope.ctx(), &r, &location)
            .await?;
        let merged = scope.logbook().merge_ops(ops)?;
        scope
            .publish(
                EventType::PullCompleted,
                json!({ "ref": r.alias(), "logsOnly": true, "mergedOps": merged }),
            )
            .await;
        return Ok(json!({ "ref": r.alias(), "mergedOps": merged }));
    }

    let ds = scope
        .loader()
        .load_dataset(scope.ctx(), &params.reference, &params.source)
        .await?;
    Ok(serde_json::to_value(&ds)?)
}

// ── Validate ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ValidateParams {
    #[serde(rename = "ref")]
    pub reference: String,
    /// Explicit body file; requires a schema source.
    pub body_file: String,
    /// Explicit schema file.
    pub schema_file: String,
}

impl MethodParams for ValidateParams {
    fn validate(&self) -> Result<(), Error> {
        if self.reference.is_empty() && (self.body_file.is_empty() || self.schema_file.is_empty())
        {
            return Err(Error::validation(
                "must provide a dataset reference, or a body file and schema file",
            ));
        }
        Ok(())
    }

    fn substitute_me(&mut self, active_username: &str) {
        substitute_me_ref(&mut self.reference, active_username);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<SchemaIssue>,
}

pub async fn validate(scope: Scope, params: ValidateParams) -> Result<ValidationReport, Error> {
    let (mut body, mut schema) = (None, None);
    if !params.reference.is_empty() {
        let ds = scope
            .loader()
            .load_dataset(scope.ctx(), &params.reference, "")
            .await?;
        schema = ds.structure.as_ref().and_then(|s| s.schema.clone());
        body = ds.body;
    }
    if !params.body_file.is_empty() {
        let path = std::path::Path::new(&params.body_file);
        let format = dataset::format_from_extension(path)?;
        let bytes = std::fs::read(path)
            .map_err(|e| Error::validation(format!("body file: {}: {e}", path.display())))?;
        let decoded = dataset::decode_body(format, &bytes)?;
        if schema.is_none() {
            schema = decoded.schema.clone();
        }
        body = Some(decoded.rows);
    }
    if !params.schema_file.is_empty() {
        let bytes = std::fs::read(&params.schema_file)
            .map_err(|e| Error::validation(format!("schema file: {e}")))?;
        schema = Some(
            serde_json::from_slice(&bytes)
                .map_err(|e| Error::validation(format!("schema file: {e}")))?,
        );
    }

    let body = body.ok_or_else(|| Error::validation("nothing to validate: no body"))?;
    let schema = schema.ok_or_else(|| Error::validation("nothing to validate: no schema"))?;
    let errors = validate_schema(&schema, &body);
    Ok(ValidationReport {
        valid: errors.is_empty(),
        errors,
    })
}

// ── Stats ────────────────────────────────────────────────────────────────

pub async fn stats(scope: Scope, params: GetParams) -> Result<Value, Error> {
    let ds = scope
        .loader()
        .load_dataset(scope.ctx(), &params.reference, &params.source)
        .await?;
    let schema = ds.structure.as_ref().and_then(|s| s.schema.as_ref());
    let rows = ds.body_rows()?;
    Ok(column_stats(rows, schema))
}
