//! The dscache: a read-mostly, workspace-aware reference cache.
//!
//! Fronts the repo's ref index for resolution and records workspace link
//! paths. Writes happen on save, init, and checkout; reads take the shared
//! lock.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;

use crate::error::Error;
use crate::refs::VersionInfo;

pub struct Dscache {
    entries: RwLock<BTreeMap<String, VersionInfo>>,
    file: Option<PathBuf>,
}

impl Dscache {
    pub fn open(file: Option<PathBuf>) -> Result<Self, Error> {
        let entries = match &file {
            Some(path) if path.exists() => {
                let raw = std::fs::read(path)
                    .map_err(|e| Error::internal(format!("reading dscache: {e}")))?;
                serde_json::from_slice(&raw)
                    .map_err(|e| Error::internal(format!("parsing dscache: {e}")))?
            }
            _ => BTreeMap::new(),
        };
        Ok(Self {
            entries: RwLock::new(entries),
            file,
        })
    }

    pub fn lookup(&self, alias: &str) -> Option<VersionInfo> {
        self.entries
            .read()
            .expect("dscache lock poisoned")
            .get(alias)
            .cloned()
    }

    /// Insert or refresh an entry, keeping any recorded workspace link.
    pub fn update(&self, info: VersionInfo) {
        let mut entries = self.entries.write().expect("dscache lock poisoned");
        let alias = info.alias();
        let fsi_path = entries
            .get(&alias)
            .map(|existing| existing.fsi_path.clone())
            .unwrap_or_default();
        let mut merged = info;
        if merged.fsi_path.is_empty() {
            merged.fsi_path = fsi_path;
        }
        entries.insert(alias, merged);
    }

    pub fn set_fsi_path(&self, alias: &str, fsi_path: &str) {
        let mut entries = self.entries.write().expect("dscache lock poisoned");
        let entry = entries.entry(alias.to_string()).or_insert_with(|| {
            let (username, name) = alias.split_once('/').unwrap_or((alias, ""));
            VersionInfo {
                username: username.to_string(),
                name: name.to_string(),
                ..Default::default()
            }
        });
        entry.fsi_path = fsi_path.to_string();
    }

    pub fn remove(&self, alias: &str) {
        self.entries
            .write()
            .expect("dscache lock poisoned")
            .remove(alias);
    }

    pub fn rename(&self, old_alias: &str, new_username: &str, new_name: &str) {
        let mut entries = self.entries.write().expect("dscache lock poisoned");
        if let Some(mut info) = entries.remove(old_alias) {
            info.username = new_username.to_string();
            info.name = new_name.to_string();
            entries.insert(info.alias(), info);
        }
    }

    pub fn list(&self) -> Vec<VersionInfo> {
        self.entries
            .read()
            .expect("dscache lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Flush to disk. Called after mutations and at shutdown.
    pub fn persist(&self) -> Result<(), Error> {
        if let Some(file) = &self.file {
            let entries = self.entries.read().expect("dscache lock poisoned");
            let data = serde_json::to_vec_pretty(&*entries)?;
            std::fs::write(file, data)
                .map_err(|e| Error::internal(format!("writing dscache: {e}")))?;
        }
        Ok(())
    }
}
