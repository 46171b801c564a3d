//! The repo: a content-addressed blob store plus the reference index.
//!
//! Blobs are canonical-JSON dataset documents named by multihash. The ref
//! index maps `username/name` aliases to the latest [`VersionInfo`]; it is
//! read-mostly and persisted as `refs.json` under the repo root.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::dataset::Dataset;
use crate::error::Error;
use crate::refs::VersionInfo;

/// Prefix of blob-store version paths.
pub const STORE_PATH_PREFIX: &str = "/store/";

/// Multihash (sha2-256) content address for a blob.
pub fn content_address(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut multihash = Vec::with_capacity(2 + digest.len());
    multihash.push(0x12);
    multihash.push(0x20);
    multihash.extend_from_slice(&digest);
    format!("{STORE_PATH_PREFIX}{}", hex::encode(multihash))
}

/// Content-addressed blob storage.
pub trait BlobStore: Send + Sync {
    /// Store `data`, returning its `/store/…` path.
    fn put(&self, data: &[u8]) -> Result<String, Error>;
    fn get(&self, path: &str) -> Result<Vec<u8>, Error>;
    fn has(&self, path: &str) -> bool;
    fn delete(&self, path: &str) -> Result<(), Error>;
}

/// In-memory blob store.
#[derive(Default)]
pub struct MemBlocks {
    blocks: DashMap<String, Vec<u8>>,
}

impl MemBlocks {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemBlocks {
    fn put(&self, data: &[u8]) -> Result<String, Error> {
        let path = content_address(data);
        self.blocks.insert(path.clone(), data.to_vec());
        Ok(path)
    }

    fn get(&self, path: &str) -> Result<Vec<u8>, Error> {
        self.blocks
            .get(path)
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::not_found(format!("blob not found: {path}")))
    }

    fn has(&self, path: &str) -> bool {
        self.blocks.contains_key(path)
    }

    fn delete(&self, path: &str) -> Result<(), Error> {
        self.blocks.remove(path);
        Ok(())
    }
}

/// Filesystem blob store: one file per blob under `<root>/blocks/`.
pub struct FsBlocks {
    dir: PathBuf,
}

impl FsBlocks {
    pub fn open(root: &Path) -> Result<Self, Error> {
        let dir = root.join("blocks");
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::internal(format!("creating block dir {}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    fn file_for(&self, path: &str) -> Option<PathBuf> {
        path.strip_prefix(STORE_PATH_PREFIX)
            .filter(|name| !name.is_empty() && name.chars().all(|c| c.is_ascii_hexdigit()))
            .map(|name| self.dir.join(name))
    }
}

impl BlobStore for FsBlocks {
    fn put(&self, data: &[u8]) -> Result<String, Error> {
        let path = content_address(data);
        let file = self.file_for(&path).expect("address has store prefix");
        if !file.exists() {
            std::fs::write(&file, data)
                .map_err(|e| Error::internal(format!("writing blob {}: {e}", file.display())))?;
        }
        Ok(path)
    }

    fn get(&self, path: &str) -> Result<Vec<u8>, Error> {
        let file = self
            .file_for(path)
            .ok_or_else(|| Error::not_found(format!("blob not found: {path}")))?;
        std::fs::read(&file).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(format!("blob not found: {path}"))
            } else {
                Error::internal(format!("reading blob {}: {e}", file.display()))
            }
        })
    }

    fn has(&self, path: &str) -> bool {
        self.file_for(path).map(|f| f.exists()).unwrap_or(false)
    }

    fn delete(&self, path: &str) -> Result<(), Error> {
        if let Some(file) = self.file_for(path) {
            if file.exists() {
                std::fs::remove_file(&file)
                    .map_err(|e| Error::internal(format!("deleting blob: {e}")))?;
            }
        }
        Ok(())
    }
}

/// Blob store plus ref index.
pub struct Repo {
    blocks: Box<dyn BlobStore>,
    refs: RwLock<BTreeMap<String, VersionInfo>>,
    refs_file: Option<PathBuf>,
}

impl Repo {
    /// Open a repo rooted at `root`, or fully in memory when `root` is None.
    pub fn open(root: Option<&Path>) -> Result<Self, Error> {
        let (blocks, refs_file): (Box<dyn BlobStore>, Option<PathBuf>) = match root {
            Some(root) => {
                std::fs::create_dir_all(root)
                    .map_err(|e| Error::internal(format!("creating repo root: {e}")))?;
                (Box::new(FsBlocks::open(root)?), Some(root.join("refs.json")))
            }
            None => (Box::new(MemBlocks::new()), None),
        };
        let refs = match &refs_file {
            Some(file) if file.exists() => {
                let raw = std::fs::read(file)
                    .map_err(|e| Error::internal(format!("reading ref index: {e}")))?;
                serde_json::from_slice(&raw)
                    .map_err(|e| Error::internal(format!("parsing ref index: {e}")))?
            }
            _ => BTreeMap::new(),
        };
        Ok(Self {
            blocks,
            refs: RwLock::new(refs),
            refs_file,
        })
    }

    // ── Blobs ──

    /// Store a dataset document, returning its version path.
    ///
    /// Display identity (username/name/path) is stripped first so the
    /// address depends only on content.
    pub fn put_dataset(&self, dataset: &Dataset) -> Result<String, Error> {
        let mut stored = dataset.clone();
        stored.username = String::new();
        stored.name = String::new();
        stored.path = String::new();
        let data = serde_json::to_vec(&stored)?;
        let path = self.blocks.put(&data)?;
        debug!(path = %path, "stored dataset version");
        Ok(path)
    }

    pub fn get_dataset(&self, path: &str) -> Result<Dataset, Error> {
        let data = self.blocks.get(path)?;
        let mut dataset: Dataset = serde_json::from_slice(&data)
            .map_err(|e| Error::internal(format!("decoding dataset {path}: {e}")))?;
        dataset.path = path.to_string();
        Ok(dataset)
    }

    pub fn has_path(&self, path: &str) -> bool {
        self.blocks.has(path)
    }

    pub fn delete_blob(&self, path: &str) -> Result<(), Error> {
        self.blocks.delete(path)
    }

    // ── Ref index ──

    pub fn resolve_alias(&self, alias: &str) -> Option<VersionInfo> {
        self.refs
            .read()
            .expect("ref index lock poisoned")
            .get(alias)
            .cloned()
    }

    pub fn put_ref(&self, info: VersionInfo) -> Result<(), Error> {
        self.refs
            .write()
            .expect("ref index lock poisoned")
            .insert(info.alias(), info);
        self.persist_refs()
    }

    pub fn delete_ref(&self, alias: &str) -> Result<(), Error> {
        self.refs
            .write()
            .expect("ref index lock poisoned")
            .remove(alias);
        self.persist_refs()
    }

    pub fn rename_ref(&self, old_alias: &str, new_username: &str, new_name: &str) -> Result<(), Error> {
        {
            let mut refs = self.refs.write().expect("ref index lock poisoned");
            let mut info = refs
                .remove(old_alias)
                .ok_or_else(|| Error::not_found(format!("reference not found: {old_alias}")))?;
            info.username = new_username.to_string();
            info.name = new_name.to_string();
            refs.insert(info.alias(), info);
        }
        self.persist_refs()
    }

    pub fn list_refs(&self, limit: usize, offset: usize) -> Vec<VersionInfo> {
        self.refs
            .read()
            .expect("ref index lock poisoned")
            .values()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Flush the ref index. Called on every mutation and at shutdown.
    pub fn persist_refs(&self) -> Result<(), Error> {
        if let Some(file) = &self.refs_file {
            let refs = self.refs.read().expect("ref index lock poisoned");
            let data = serde_json::to_vec_pretty(&*refs)?;
            std::fs::write(file, data)
                .map_err(|e| Error::internal(format!("writing ref index: {e}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Dataset {
        Dataset {
            body: Some(json!([[1, 2], [3, 4]])),
            ..Default::default()
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let repo = Repo::open(None).unwrap();
        let path = repo.put_dataset(&sample()).unwrap();
        assert!(path.starts_with(STORE_PATH_PREFIX));
        assert!(repo.has_path(&path));
        let loaded = repo.get_dataset(&path).unwrap();
        assert_eq!(loaded.body, sample().body);
        assert_eq!(loaded.path, path);
    }

    #[test]
    fn address_ignores_display_identity() {
        let repo = Repo::open(None).unwrap();
        let plain = repo.put_dataset(&sample()).unwrap();
        let named = repo
            .put_dataset(&sample().with_ref("peer", "cities", "/store/old"))
            .unwrap();
        assert_eq!(plain, named);
    }

    #[test]
    fn missing_blob_is_not_found() {
        let repo = Repo::open(None).unwrap();
        let err = repo.get_dataset("/store/1220dead").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn ref_index_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let repo = Repo::open(Some(dir.path())).unwrap();
            repo.put_ref(VersionInfo {
                username: "peer".into(),
                name: "cities".into(),
                path: "/store/1220aa".into(),
                ..Default::default()
            })
            .unwrap();
        }
        let reopened = Repo::open(Some(dir.path())).unwrap();
        let info = reopened.resolve_alias("peer/cities").unwrap();
        assert_eq!(info.path, "/store/1220aa");
    }

    #[test]
    fn rename_moves_the_index_entry() {
        let repo = Repo::open(None).unwrap();
        repo.put_ref(VersionInfo {
            username: "peer".into(),
            name: "old".into(),
            path: "/store/1220aa".into(),
            ..Default::default()
        })
        .unwrap();
        repo.rename_ref("peer/old", "peer", "new").unwrap();
        assert!(repo.resolve_alias("peer/old").is_none());
        assert_eq!(repo.resolve_alias("peer/new").unwrap().name, "new");
    }

    #[test]
    fn fs_blocks_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let repo = Repo::open(Some(dir.path())).unwrap();
            repo.put_dataset(&sample()).unwrap()
        };
        let reopened = Repo::open(Some(dir.path())).unwrap();
        assert!(reopened.has_path(&path));
    }
}
