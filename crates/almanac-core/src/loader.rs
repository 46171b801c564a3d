//! The multi-source dataset loader.
//!
//! Given a ref string and a source hint, the loader resolves through the
//! hint's resolver tree, pulls missing versions from a remote (coalescing
//! concurrent pulls of the same version), and loads locally from either the
//! blob store or a linked working directory.

use std::sync::Arc;

use almanac_events::{Bus, EventType};
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dataset::Dataset;
use crate::dscache::Dscache;
use crate::error::Error;
use crate::fsi;
use crate::logbook::Logbook;
use crate::p2p::{P2pNode, P2pResolver};
use crate::refs::{Ref, VersionInfo};
use crate::registry::{HttpRegistryClient, RegistryClient};
use crate::remote::RemoteClient;
use crate::repo::Repo;
use crate::resolver::{
    DscacheResolver, LogbookResolver, ParallelResolver, RegistryResolver, RepoResolver, Resolver,
    SequentialResolver,
};

/// Source hints understood by [`Loader::resolver_for`].
pub const SOURCE_LOCAL: &str = "local";
pub const SOURCE_NETWORK: &str = "network";
pub const SOURCE_REGISTRY: &str = "registry";
pub const SOURCE_P2P: &str = "p2p";

type PullKey = (String, String);
type PullCell = Arc<OnceCell<Result<String, Error>>>;

pub struct Loader {
    repo: Arc<Repo>,
    logbook: Arc<Logbook>,
    dscache: Arc<Dscache>,
    registry: Arc<dyn RegistryClient>,
    remote: Arc<dyn RemoteClient>,
    p2p: Option<Arc<P2pNode>>,
    bus: Bus,
    inflight: DashMap<PullKey, PullCell>,
}

impl Loader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<Repo>,
        logbook: Arc<Logbook>,
        dscache: Arc<Dscache>,
        registry: Arc<dyn RegistryClient>,
        remote: Arc<dyn RemoteClient>,
        p2p: Option<Arc<P2pNode>>,
        bus: Bus,
    ) -> Self {
        Self {
            repo,
            logbook,
            dscache,
            registry,
            remote,
            p2p,
            bus,
            inflight: DashMap::new(),
        }
    }

    pub fn repo(&self) -> &Arc<Repo> {
        &self.repo
    }

    /// The resolver tree for a source hint. Unknown hints are treated as
    /// remote registry addresses.
    pub fn resolver_for(&self, source: &str) -> Result<Arc<dyn Resolver>, Error> {
        let cache = || Arc::new(DscacheResolver::new(self.dscache.clone())) as Arc<dyn Resolver>;
        let repo = || Arc::new(RepoResolver::new(self.repo.clone())) as Arc<dyn Resolver>;
        let logbook = || Arc::new(LogbookResolver::new(self.logbook.clone())) as Arc<dyn Resolver>;
        let registry =
            || Arc::new(RegistryResolver::new(self.registry.clone())) as Arc<dyn Resolver>;

        Ok(match source {
            "" => Arc::new(SequentialResolver::new(vec![
                cache(),
                repo(),
                logbook(),
                Arc::new(ParallelResolver::new(vec![registry()])),
            ])),
            SOURCE_LOCAL => {
                Arc::new(SequentialResolver::new(vec![cache(), repo(), logbook()]))
            }
            SOURCE_NETWORK => {
                let mut network = vec![registry()];
                if let Some(node) = &self.p2p {
                    network.push(Arc::new(P2pResolver::new(node.clone())) as Arc<dyn Resolver>);
                }
                Arc::new(ParallelResolver::new(network))
            }
            SOURCE_REGISTRY => registry(),
            SOURCE_P2P => {
                let node = self
                    .p2p
                    .as_ref()
                    .ok_or_else(|| Error::validation("p2p is not enabled"))?;
                Arc::new(P2pResolver::new(node.clone()))
            }
            address => Arc::new(RegistryResolver::new(Arc::new(HttpRegistryClient::new(
                address,
            )))),
        })
    }

    /// Resolve `r` in place through the hint's tree, returning the network
    /// location (empty for local content).
    pub async fn resolve_ref(
        &self,
        ctx: &CancellationToken,
        r: &mut Ref,
        source: &str,
    ) -> Result<String, Error> {
        self.resolver_for(source)?.resolve(ctx, r).await
    }

    /// Load a dataset by ref string.
    ///
    /// `me` must already have been substituted; the loader has no active
    /// profile of its own.
    pub async fn load_dataset(
        &self,
        ctx: &CancellationToken,
        refstr: &str,
        source: &str,
    ) -> Result<Dataset, Error> {
        let mut r = Ref::parse_relaxed(refstr)?;
        if r.is_me() {
            return Err(Error::validation(
                "cannot use the \"me\" keyword without an active profile",
            ));
        }

        // Pinned and locally present: no resolution needed.
        if let Some(path) = r.path.clone() {
            if self.is_local_path(&path) {
                return self.load_local(&r).await;
            }
        }

        let location = self.resolve_ref(ctx, &mut r, source).await?;
        let path = r
            .path
            .clone()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::not_found(format!("dataset has no history: {}", r.alias())))?;

        if !location.is_empty() && !self.is_local_path(&path) {
            let stored = self.pull_coalesced(ctx, &r, &location).await?;
            r.path = Some(stored);
        }
        self.load_local(&r).await
    }

    fn is_local_path(&self, path: &str) -> bool {
        path.starts_with(fsi::WORKSPACE_PATH_PREFIX) || self.repo.has_path(path)
    }

    async fn load_local(&self, r: &Ref) -> Result<Dataset, Error> {
        let path = r.path.as_deref().unwrap_or_default();
        let dataset = if let Some(dir) = fsi::dir_for_workspace_path(path) {
            fsi::read_dir_dataset(&dir).map_err(|e| e.context("loading workspace dataset"))?
        } else {
            self.repo
                .get_dataset(path)
                .map_err(|e| e.context("loading dataset"))?
        };
        Ok(dataset.with_ref(&r.username, &r.name, path))
    }

    /// Pull `r.path` from `location`, coalescing concurrent pulls of the
    /// same `(path, location)` pair into one remote fetch. Returns the local
    /// path the content was stored under.
    async fn pull_coalesced(
        &self,
        ctx: &CancellationToken,
        r: &Ref,
        location: &str,
    ) -> Result<String, Error> {
        let key: PullKey = (
            r.path.clone().unwrap_or_default(),
            location.to_string(),
        );
        let cell = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        let result = cell
            .get_or_init(|| self.do_pull(ctx, r, location))
            .await
            .clone();
        self.inflight
            .remove_if(&key, |_, value| Arc::ptr_eq(value, &cell));
        result
    }

    async fn do_pull(
        &self,
        ctx: &CancellationToken,
        r: &Ref,
        location: &str,
    ) -> Result<String, Error> {
        self.bus
            .publish(
                ctx,
                EventType::PullStarted,
                json!({ "ref": r.to_string(), "location": location }),
            )
            .await;

        let mut attempt = self.remote.pull_dataset(ctx, r, location).await;
        if let Err(err) = &attempt {
            if err.kind() == crate::error::ErrorKind::TransientNetwork {
                debug!(r = %r, error = %err, "pull failed, retrying once");
                attempt = self.remote.pull_dataset(ctx, r, location).await;
            }
        }
        let dataset = attempt.map_err(|e| e.context(&format!("pulling {}", r.alias())))?;

        let stored_path = self.repo.put_dataset(&dataset)?;
        let info = VersionInfo {
            username: r.username.clone(),
            name: r.name.clone(),
            profile_id: r.profile_id.clone(),
            path: stored_path.clone(),
            commit_title: dataset
                .commit
                .as_ref()
                .map(|c| c.title.clone())
                .unwrap_or_default(),
            commit_time: dataset.commit.as_ref().and_then(|c| c.timestamp),
            body_size: dataset
                .structure
                .as_ref()
                .map(|s| s.length)
                .unwrap_or_default(),
            body_rows: dataset
                .structure
                .as_ref()
                .map(|s| s.entries)
                .unwrap_or_default(),
            ..Default::default()
        };
        self.repo.put_ref(info.clone())?;
        self.dscache.update(info);

        {
            // Record the pulled version so local history sees it.
            let _guard = self.logbook.lock_ref(&r.alias()).await;
            if !self.logbook.has_ref(&r.alias()) {
                self.logbook
                    .write_init(&Ref::new(&r.username, &r.name))?;
            }
            if self.logbook.resolve(&r.alias()).as_deref() != Some(stored_path.as_str()) {
                let title = dataset
                    .commit
                    .as_ref()
                    .map(|c| c.title.clone())
                    .unwrap_or_default();
                self.logbook
                    .write_commit(&Ref::new(&r.username, &r.name), &stored_path, &title)?;
            }
        }

        info!(r = %r, path = %stored_path, "pulled dataset");
        self.bus
            .publish(
                ctx,
                EventType::PullCompleted,
                json!({ "ref": r.to_string(), "path": stored_path }),
            )
            .await;
        Ok(stored_path)
    }
}
