//! The logbook: an append-only op log recording dataset lifecycle events.
//!
//! Ops are persisted as JSON lines. Saves for one ref serialise through a
//! per-ref async lock; readers fold the op list into version histories.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::clock::Clock;
use crate::error::Error;
use crate::refs::{Ref, VersionInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Init,
    Commit,
    Delete,
    Rename,
    Push,
    Pull,
}

/// One logbook entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogOp {
    pub kind: OpKind,
    pub username: String,
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub note: String,
    /// For deletes: how many versions, -1 for all.
    #[serde(skip_serializing_if = "is_zero")]
    pub revisions: i64,
    /// For renames: the new identity.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub to_username: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub to_name: String,
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

impl Default for LogOp {
    fn default() -> Self {
        Self {
            kind: OpKind::Init,
            username: String::new(),
            name: String::new(),
            path: String::new(),
            timestamp: DateTime::<Utc>::MIN_UTC,
            note: String::new(),
            revisions: 0,
            to_username: String::new(),
            to_name: String::new(),
        }
    }
}

impl LogOp {
    pub fn alias(&self) -> String {
        format!("{}/{}", self.username, self.name)
    }
}

pub struct Logbook {
    ops: RwLock<Vec<LogOp>>,
    file: Option<PathBuf>,
    ref_locks: DashMap<String, Arc<Mutex<()>>>,
    clock: Clock,
}

impl Logbook {
    /// Open a logbook backed by a JSON-lines file, or in memory.
    pub fn open(file: Option<PathBuf>, clock: Clock) -> Result<Self, Error> {
        let mut ops = Vec::new();
        if let Some(path) = &file {
            if path.exists() {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| Error::internal(format!("reading logbook: {e}")))?;
                for line in raw.lines().filter(|l| !l.trim().is_empty()) {
                    let op: LogOp = serde_json::from_str(line)
                        .map_err(|e| Error::internal(format!("parsing logbook: {e}")))?;
                    ops.push(op);
                }
            }
        }
        Ok(Self {
            ops: RwLock::new(ops),
            file,
            ref_locks: DashMap::new(),
            clock,
        })
    }

    /// Acquire the per-ref write lock. Saves hold this across the whole
    /// version materialisation.
    pub async fn lock_ref(&self, alias: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .ref_locks
            .entry(alias.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    pub fn has_ref(&self, alias: &str) -> bool {
        self.histories().contains_key(alias)
    }

    /// Record dataset initialisation. Fails if the ref already has a log.
    pub fn write_init(&self, r: &Ref) -> Result<(), Error> {
        if self.has_ref(&r.alias()) {
            return Err(Error::conflict(format!("dataset {} already exists", r.alias())));
        }
        self.append(LogOp {
            kind: OpKind::Init,
            username: r.username.clone(),
            name: r.name.clone(),
            timestamp: self.clock.now(),
            ..Default::default()
        })
    }

    pub fn write_commit(&self, r: &Ref, path: &str, title: &str) -> Result<(), Error> {
        self.append(LogOp {
            kind: OpKind::Commit,
            username: r.username.clone(),
            name: r.name.clone(),
            path: path.to_string(),
            timestamp: self.clock.now(),
            note: title.to_string(),
            ..Default::default()
        })
    }

    pub fn write_delete(&self, r: &Ref, revisions: i64) -> Result<(), Error> {
        self.append(LogOp {
            kind: OpKind::Delete,
            username: r.username.clone(),
            name: r.name.clone(),
            timestamp: self.clock.now(),
            revisions,
            ..Default::default()
        })
    }

    pub fn write_rename(&self, from: &Ref, to: &Ref) -> Result<(), Error> {
        self.append(LogOp {
            kind: OpKind::Rename,
            username: from.username.clone(),
            name: from.name.clone(),
            timestamp: self.clock.now(),
            to_username: to.username.clone(),
            to_name: to.name.clone(),
            ..Default::default()
        })
    }

    pub fn write_push(&self, r: &Ref, remote: &str) -> Result<(), Error> {
        self.append(LogOp {
            kind: OpKind::Push,
            username: r.username.clone(),
            name: r.name.clone(),
            path: r.path.clone().unwrap_or_default(),
            timestamp: self.clock.now(),
            note: remote.to_string(),
            ..Default::default()
        })
    }

    /// Merge ops pulled from a remote log, skipping ones already present.
    pub fn merge_ops(&self, incoming: Vec<LogOp>) -> Result<usize, Error> {
        let mut merged = 0;
        for op in incoming {
            let exists = {
                let ops = self.ops.read().expect("logbook lock poisoned");
                ops.iter().any(|o| *o == op)
            };
            if !exists {
                self.append(op)?;
                merged += 1;
            }
        }
        Ok(merged)
    }

    /// Latest version path for a ref, if it has history.
    pub fn resolve(&self, alias: &str) -> Option<String> {
        self.versions_for(alias)
            .and_then(|versions| versions.first().map(|v| v.path.clone()))
    }

    /// Version history for a ref, newest first. `None` when the ref has no
    /// log at all; an empty list when it is known but has no commits.
    pub fn versions_for(&self, alias: &str) -> Option<Vec<VersionInfo>> {
        self.histories().get(alias).cloned()
    }

    /// All ops, in append order. Local transport only.
    pub fn raw(&self) -> Vec<LogOp> {
        self.ops.read().expect("logbook lock poisoned").clone()
    }

    /// Per-ref op counts and latest paths. Local transport only.
    pub fn summary(&self) -> Value {
        let histories = self.histories();
        let refs: Vec<Value> = histories
            .iter()
            .map(|(alias, versions)| {
                json!({
                    "ref": alias,
                    "versions": versions.len(),
                    "latestPath": versions.first().map(|v| v.path.clone()).unwrap_or_default(),
                })
            })
            .collect();
        json!({
            "totalOps": self.ops.read().expect("logbook lock poisoned").len(),
            "refs": refs,
        })
    }

    /// Flush any buffered state. JSON lines are written eagerly, so this is
    /// a no-op kept for lifecycle symmetry.
    pub fn close(&self) -> Result<(), Error> {
        Ok(())
    }

    fn append(&self, op: LogOp) -> Result<(), Error> {
        let mut ops = self.ops.write().expect("logbook lock poisoned");
        if let Some(file) = &self.file {
            use std::io::Write;
            let mut line = serde_json::to_vec(&op)?;
            line.push(b'\n');
            let mut f = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .map_err(|e| Error::internal(format!("opening logbook: {e}")))?;
            f.write_all(&line)
                .map_err(|e| Error::internal(format!("appending to logbook: {e}")))?;
        }
        ops.push(op);
        Ok(())
    }

    /// Fold the op list into per-ref version histories (newest first).
    fn histories(&self) -> BTreeMap<String, Vec<VersionInfo>> {
        let ops = self.ops.read().expect("logbook lock poisoned");
        let mut map: BTreeMap<String, Vec<VersionInfo>> = BTreeMap::new();
        for op in ops.iter() {
            match op.kind {
                OpKind::Init => {
                    map.entry(op.alias()).or_default();
                }
                OpKind::Commit => {
                    let versions = map.entry(op.alias()).or_default();
                    versions.insert(
                        0,
                        VersionInfo {
                            username: op.username.clone(),
                            name: op.name.clone(),
                            path: op.path.clone(),
                            commit_title: op.note.clone(),
                            commit_time: Some(op.timestamp),
                            ..Default::default()
                        },
                    );
                }
                OpKind::Delete => {
                    if op.revisions < 0 {
                        map.remove(&op.alias());
                    } else if let Some(versions) = map.get_mut(&op.alias()) {
                        let n = (op.revisions as usize).min(versions.len());
                        versions.drain(..n);
                    }
                }
                OpKind::Rename => {
                    if let Some(mut versions) = map.remove(&op.alias()) {
                        for v in &mut versions {
                            v.username = op.to_username.clone();
                            v.name = op.to_name.clone();
                        }
                        map.insert(format!("{}/{}", op.to_username, op.to_name), versions);
                    }
                }
                OpKind::Push | OpKind::Pull => {}
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn book() -> Logbook {
        let start = Utc.with_ymd_and_hms(2001, 1, 1, 0, 0, 0).unwrap();
        Logbook::open(None, Clock::ticking(start, 60)).unwrap()
    }

    #[test]
    fn init_then_commit_builds_history() {
        let book = book();
        let r = Ref::new("peer", "cities");
        book.write_init(&r).unwrap();
        book.write_commit(&r, "/store/1220aa", "created dataset").unwrap();
        book.write_commit(&r, "/store/1220bb", "added rows").unwrap();

        let versions = book.versions_for("peer/cities").unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].path, "/store/1220bb");
        assert_eq!(versions[1].path, "/store/1220aa");
        assert_eq!(book.resolve("peer/cities").unwrap(), "/store/1220bb");
    }

    #[test]
    fn init_twice_is_a_conflict() {
        let book = book();
        let r = Ref::new("peer", "cities");
        book.write_init(&r).unwrap();
        let err = book.write_init(&r).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    #[test]
    fn init_without_commits_resolves_to_no_history() {
        let book = book();
        let r = Ref::new("peer", "cities");
        book.write_init(&r).unwrap();
        assert!(book.has_ref("peer/cities"));
        assert_eq!(book.resolve("peer/cities"), None);
        assert_eq!(book.versions_for("peer/cities").unwrap().len(), 0);
    }

    #[test]
    fn delete_drops_newest_revisions() {
        let book = book();
        let r = Ref::new("peer", "cities");
        book.write_init(&r).unwrap();
        book.write_commit(&r, "/store/1220aa", "one").unwrap();
        book.write_commit(&r, "/store/1220bb", "two").unwrap();
        book.write_delete(&r, 1).unwrap();
        assert_eq!(book.resolve("peer/cities").unwrap(), "/store/1220aa");

        book.write_delete(&r, -1).unwrap();
        assert!(!book.has_ref("peer/cities"));
    }

    #[test]
    fn rename_rekeys_history() {
        let book = book();
        let r = Ref::new("peer", "old");
        book.write_init(&r).unwrap();
        book.write_commit(&r, "/store/1220aa", "one").unwrap();
        book.write_rename(&r, &Ref::new("peer", "new")).unwrap();

        assert!(!book.has_ref("peer/old"));
        let versions = book.versions_for("peer/new").unwrap();
        assert_eq!(versions[0].name, "new");
    }

    #[test]
    fn ops_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("logbook.jsonl");
        let r = Ref::new("peer", "cities");
        {
            let book = Logbook::open(Some(file.clone()), Clock::system()).unwrap();
            book.write_init(&r).unwrap();
            book.write_commit(&r, "/store/1220aa", "one").unwrap();
        }
        let reopened = Logbook::open(Some(file), Clock::system()).unwrap();
        assert_eq!(reopened.resolve("peer/cities").unwrap(), "/store/1220aa");
    }

    #[test]
    fn merge_skips_duplicate_ops() {
        let book = book();
        let r = Ref::new("peer", "cities");
        book.write_init(&r).unwrap();
        let ops = book.raw();
        assert_eq!(book.merge_ops(ops).unwrap(), 0);
    }
}
