//! Filesystem integration (FSI): on-disk workspaces linked to refs.
//!
//! A linked directory holds the dataset's components as editable files
//! (`meta.json`, `structure.json`, `body.csv` or `body.json`, `readme.md`)
//! plus a `.almanac-ref` link file naming the ref. Version paths with the
//! `/fsi/` prefix are loaded from the linked directory instead of the blob
//! store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::dataset::{self, Dataset, Meta, Readme, Structure, FORMAT_CSV, FORMAT_JSON};
use crate::dscache::Dscache;
use crate::error::Error;

/// Prefix of workspace version paths.
pub const WORKSPACE_PATH_PREFIX: &str = "/fsi/";

/// Name of the per-directory link file.
pub const LINK_FILE: &str = ".almanac-ref";

const COMPONENTS: [&str; 4] = ["meta", "structure", "body", "readme"];

/// Per-component working-directory status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Unmodified,
    Modified,
    Add,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusItem {
    pub component: String,
    pub status: ComponentStatus,
}

/// Workspace manager. Owns link bookkeeping; component file IO is in the
/// free functions below.
pub struct Fsi {
    dscache: Arc<Dscache>,
}

impl Fsi {
    pub fn new(dscache: Arc<Dscache>) -> Self {
        Self { dscache }
    }

    /// Record a link between `alias` and `dir`: a link file on disk plus the
    /// dscache entry.
    pub fn create_link(&self, alias: &str, dir: &Path) -> Result<(), Error> {
        std::fs::write(dir.join(LINK_FILE), format!("{alias}\n"))
            .map_err(|e| Error::internal(format!("writing link file: {e}")))?;
        self.dscache.set_fsi_path(alias, &dir.to_string_lossy());
        debug!(alias, dir = %dir.display(), "linked workspace");
        Ok(())
    }

    pub fn unlink(&self, alias: &str) -> Result<bool, Error> {
        let Some(entry) = self.dscache.lookup(alias) else {
            return Ok(false);
        };
        if entry.fsi_path.is_empty() {
            return Ok(false);
        }
        let link = Path::new(&entry.fsi_path).join(LINK_FILE);
        if link.exists() {
            std::fs::remove_file(&link)
                .map_err(|e| Error::internal(format!("removing link file: {e}")))?;
        }
        self.dscache.set_fsi_path(alias, "");
        Ok(true)
    }

    /// The linked directory for `alias`, if any.
    pub fn linked_dir(&self, alias: &str) -> Option<PathBuf> {
        self.dscache
            .lookup(alias)
            .filter(|entry| !entry.fsi_path.is_empty())
            .map(|entry| PathBuf::from(entry.fsi_path))
    }

    /// The alias linked to `dir`, read from its link file.
    pub fn alias_for_dir(&self, dir: &Path) -> Result<String, Error> {
        let raw = std::fs::read_to_string(dir.join(LINK_FILE)).map_err(|_| {
            Error::not_found(format!("directory {} is not linked to a dataset", dir.display()))
        })?;
        Ok(raw.trim().to_string())
    }

    /// Compare the stored version against the working directory.
    pub fn status(&self, stored: Option<&Dataset>, dir: &Path) -> Result<Vec<StatusItem>, Error> {
        let working = read_dir_dataset(dir)?;
        let mut items = Vec::new();
        for component in COMPONENTS {
            let stored_value = stored.and_then(|d| component_value(d, component));
            let working_value = component_value(&working, component);
            let status = match (stored_value, working_value) {
                (None, None) => continue,
                (None, Some(_)) => ComponentStatus::Add,
                (Some(_), None) => ComponentStatus::Remove,
                (Some(a), Some(b)) if a == b => ComponentStatus::Unmodified,
                _ => ComponentStatus::Modified,
            };
            items.push(StatusItem {
                component: component.to_string(),
                status,
            });
        }
        Ok(items)
    }
}

fn component_value(dataset: &Dataset, component: &str) -> Option<Value> {
    match component {
        "meta" => dataset.meta.as_ref().map(|m| serde_json::to_value(m).unwrap_or_default()),
        "structure" => dataset.structure.as_ref().map(|s| {
            // Entries and length are derived; only format and schema are
            // compared for workspace status.
            serde_json::json!({ "format": s.format, "schema": s.schema })
        }),
        "body" => dataset.body.clone(),
        "readme" => dataset.readme.as_ref().map(|r| Value::String(r.text.clone())),
        _ => None,
    }
}

/// Write a dataset's editable components into `dir`.
pub fn write_components(dataset: &Dataset, dir: &Path) -> Result<(), Error> {
    let write_json = |name: &str, value: &Value| -> Result<(), Error> {
        let data = serde_json::to_vec_pretty(value)?;
        std::fs::write(dir.join(name), data)
            .map_err(|e| Error::internal(format!("writing {name}: {e}")))
    };
    if let Some(meta) = &dataset.meta {
        write_json("meta.json", &serde_json::to_value(meta)?)?;
    }
    if let Some(structure) = &dataset.structure {
        write_json("structure.json", &serde_json::to_value(structure)?)?;
    }
    if let Some(readme) = &dataset.readme {
        std::fs::write(dir.join("readme.md"), &readme.text)
            .map_err(|e| Error::internal(format!("writing readme.md: {e}")))?;
    }
    if let Some(body) = &dataset.body {
        let format = dataset
            .structure
            .as_ref()
            .map(|s| s.format.as_str())
            .unwrap_or(FORMAT_JSON);
        if format == FORMAT_CSV {
            let rows = body.as_array().cloned().unwrap_or_default();
            let schema = dataset.structure.as_ref().and_then(|s| s.schema.as_ref());
            let bytes = dataset::encode_csv(&rows, schema)?;
            std::fs::write(dir.join("body.csv"), bytes)
                .map_err(|e| Error::internal(format!("writing body.csv: {e}")))?;
        } else {
            write_json("body.json", body)?;
        }
    }
    Ok(())
}

/// Read a dataset back from a working directory.
pub fn read_dir_dataset(dir: &Path) -> Result<Dataset, Error> {
    if !dir.is_dir() {
        return Err(Error::not_found(format!(
            "working directory not found: {}",
            dir.display()
        )));
    }
    let mut dataset = Dataset::default();

    let meta_file = dir.join("meta.json");
    if meta_file.exists() {
        let raw = std::fs::read(&meta_file)
            .map_err(|e| Error::internal(format!("reading meta.json: {e}")))?;
        let meta: Meta = serde_json::from_slice(&raw)
            .map_err(|e| Error::validation(format!("meta.json: {e}")))?;
        dataset.meta = Some(meta);
    }

    let structure_file = dir.join("structure.json");
    if structure_file.exists() {
        let raw = std::fs::read(&structure_file)
            .map_err(|e| Error::internal(format!("reading structure.json: {e}")))?;
        let structure: Structure = serde_json::from_slice(&raw)
            .map_err(|e| Error::validation(format!("structure.json: {e}")))?;
        dataset.structure = Some(structure);
    }

    let readme_file = dir.join("readme.md");
    if readme_file.exists() {
        let text = std::fs::read_to_string(&readme_file)
            .map_err(|e| Error::internal(format!("reading readme.md: {e}")))?;
        dataset.readme = Some(Readme { text });
    }

    for (file, format) in [("body.csv", FORMAT_CSV), ("body.json", FORMAT_JSON)] {
        let body_file = dir.join(file);
        if body_file.exists() {
            let bytes = std::fs::read(&body_file)
                .map_err(|e| Error::internal(format!("reading {file}: {e}")))?;
            let body = dataset::decode_body(format, &bytes)?;
            let mut structure = dataset.structure.take().unwrap_or_default();
            structure.format = format.to_string();
            structure.entries = body.entries();
            structure.length = body.length;
            if structure.schema.is_none() {
                structure.schema = body.schema.clone();
            }
            dataset.structure = Some(structure);
            dataset.body = Some(body.rows);
            break;
        }
    }

    Ok(dataset)
}

/// Workspace version path for a linked directory.
pub fn workspace_path(dir: &Path) -> String {
    format!("{WORKSPACE_PATH_PREFIX}{}", dir.to_string_lossy().trim_start_matches('/'))
}

/// Directory named by a `/fsi/…` version path.
pub fn dir_for_workspace_path(path: &str) -> Option<PathBuf> {
    path.strip_prefix(WORKSPACE_PATH_PREFIX)
        .map(|rest| PathBuf::from(format!("/{rest}")))
}

/// Create `path` and any missing ancestors, returning the directories that
/// were actually created, outermost first. Callers remove these (in reverse)
/// to roll back a failed init.
pub fn create_dirs_tracked(path: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut missing = Vec::new();
    let mut cursor = Some(path);
    while let Some(dir) = cursor {
        if dir.exists() {
            break;
        }
        missing.push(dir.to_path_buf());
        cursor = dir.parent();
    }
    missing.reverse();
    for dir in &missing {
        std::fs::create_dir(dir)
            .map_err(|e| Error::internal(format!("creating directory {}: {e}", dir.display())))?;
    }
    Ok(missing)
}

/// Remove directories created by [`create_dirs_tracked`], innermost first.
pub fn remove_created_dirs(created: &[PathBuf]) {
    for dir in created.iter().rev() {
        if let Err(err) = std::fs::remove_dir_all(dir) {
            debug!(dir = %dir.display(), error = %err, "rollback: could not remove directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cities() -> Dataset {
        Dataset {
            meta: Some(Meta {
                title: "cities".into(),
                ..Default::default()
            }),
            structure: Some(Structure {
                format: FORMAT_CSV.into(),
                schema: Some(json!({
                    "type": "array",
                    "items": {"type": "array", "items": [{"title": "city"}, {"title": "pop"}]},
                })),
                entries: 2,
                length: 30,
            }),
            body: Some(json!([["toronto", 4000], ["osaka", 19000]])),
            ..Default::default()
        }
    }

    #[test]
    fn components_round_trip_through_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_components(&cities(), dir.path()).unwrap();
        let read = read_dir_dataset(dir.path()).unwrap();
        assert_eq!(read.meta.unwrap().title, "cities");
        assert_eq!(read.body, cities().body);
        assert_eq!(read.structure.unwrap().entries, 2);
    }

    #[test]
    fn status_reports_per_component_changes() {
        let dir = tempfile::tempdir().unwrap();
        write_components(&cities(), dir.path()).unwrap();

        // Modify the body, remove meta, add a readme.
        std::fs::write(dir.path().join("body.csv"), "city,pop\nlagos,21000\n").unwrap();
        std::fs::remove_file(dir.path().join("meta.json")).unwrap();
        std::fs::write(dir.path().join("readme.md"), "# cities\n").unwrap();

        let cache = Arc::new(Dscache::open(None).unwrap());
        let fsi = Fsi::new(cache);
        let stored = cities();
        let items = fsi.status(Some(&stored), dir.path()).unwrap();
        let get = |component: &str| {
            items
                .iter()
                .find(|i| i.component == component)
                .map(|i| i.status)
        };
        assert_eq!(get("body"), Some(ComponentStatus::Modified));
        assert_eq!(get("meta"), Some(ComponentStatus::Remove));
        assert_eq!(get("readme"), Some(ComponentStatus::Add));
    }

    #[test]
    fn unchanged_directory_is_unmodified() {
        let dir = tempfile::tempdir().unwrap();
        write_components(&cities(), dir.path()).unwrap();
        let cache = Arc::new(Dscache::open(None).unwrap());
        let fsi = Fsi::new(cache);
        let items = fsi.status(Some(&cities()), dir.path()).unwrap();
        assert!(items.iter().all(|i| i.status == ComponentStatus::Unmodified));
    }

    #[test]
    fn link_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(Dscache::open(None).unwrap());
        let fsi = Fsi::new(cache);
        fsi.create_link("peer/cities", dir.path()).unwrap();
        assert_eq!(fsi.alias_for_dir(dir.path()).unwrap(), "peer/cities");
        assert_eq!(fsi.linked_dir("peer/cities").unwrap(), dir.path());
        assert!(fsi.unlink("peer/cities").unwrap());
        assert!(fsi.linked_dir("peer/cities").is_none());
    }

    #[test]
    fn create_dirs_tracked_reports_only_new_dirs() {
        let root = tempfile::tempdir().unwrap();
        let pre = root.path().join("path");
        std::fs::create_dir(&pre).unwrap();
        let target = pre.join("to").join("dataset");

        let created = create_dirs_tracked(&target).unwrap();
        assert_eq!(created, vec![pre.join("to"), pre.join("to").join("dataset")]);
        assert!(target.is_dir());

        remove_created_dirs(&created);
        assert!(!pre.join("to").exists());
        assert!(pre.exists());
    }

    #[test]
    fn workspace_path_round_trip() {
        let path = workspace_path(Path::new("/tmp/work/cities"));
        assert_eq!(path, "/fsi/tmp/work/cities");
        assert_eq!(
            dir_for_workspace_path(&path).unwrap(),
            PathBuf::from("/tmp/work/cities")
        );
    }
}
