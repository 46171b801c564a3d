//! Reference resolution: a composable pipeline of local and network
//! resolvers.
//!
//! A resolver fills a ref's version path and returns a *source location*:
//! empty when the content is fully local, otherwise an opaque network
//! address content can be pulled from. [`SequentialResolver`] falls through
//! `not-found` results in order; [`ParallelResolver`] races its children and
//! cancels the losers.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dscache::Dscache;
use crate::error::Error;
use crate::logbook::Logbook;
use crate::refs::Ref;
use crate::registry::RegistryClient;
use crate::repo::Repo;

#[async_trait]
pub trait Resolver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Resolve `r` in place: on success `r.path` is populated and the
    /// returned string is the network location, empty for local content.
    async fn resolve(&self, ctx: &CancellationToken, r: &mut Ref) -> Result<String, Error>;
}

fn miss(r: &Ref) -> Error {
    Error::not_found(format!("reference not found: {}", r.alias()))
}

// ── Combinators ──────────────────────────────────────────────────────────

/// Tries each resolver in order, continuing past `not-found` and surfacing
/// any other error immediately.
pub struct SequentialResolver {
    resolvers: Vec<Arc<dyn Resolver>>,
}

impl SequentialResolver {
    pub fn new(resolvers: Vec<Arc<dyn Resolver>>) -> Self {
        Self { resolvers }
    }
}

#[async_trait]
impl Resolver for SequentialResolver {
    fn name(&self) -> &'static str {
        "sequential"
    }

    async fn resolve(&self, ctx: &CancellationToken, r: &mut Ref) -> Result<String, Error> {
        for resolver in &self.resolvers {
            if ctx.is_cancelled() {
                return Err(Error::cancelled());
            }
            match resolver.resolve(ctx, r).await {
                Ok(location) => {
                    debug!(resolver = resolver.name(), r = %r, "resolved");
                    return Ok(location);
                }
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err),
            }
        }
        Err(miss(r))
    }
}

/// Launches all resolvers concurrently, returns the first success, and
/// cancels the rest. `not-found` surfaces only when every child misses.
pub struct ParallelResolver {
    resolvers: Vec<Arc<dyn Resolver>>,
}

impl ParallelResolver {
    pub fn new(resolvers: Vec<Arc<dyn Resolver>>) -> Self {
        Self { resolvers }
    }
}

#[async_trait]
impl Resolver for ParallelResolver {
    fn name(&self) -> &'static str {
        "parallel"
    }

    async fn resolve(&self, ctx: &CancellationToken, r: &mut Ref) -> Result<String, Error> {
        let race = ctx.child_token();
        let mut set = JoinSet::new();
        for resolver in &self.resolvers {
            let resolver = resolver.clone();
            let token = race.clone();
            let mut candidate = r.clone();
            set.spawn(async move {
                let result = tokio::select! {
                    _ = token.cancelled() => Err(Error::cancelled()),
                    res = resolver.resolve(&token, &mut candidate) => res,
                };
                (resolver.name(), candidate, result)
            });
        }

        let mut hard_error: Option<Error> = None;
        while let Some(joined) = set.join_next().await {
            let Ok((name, candidate, result)) = joined else {
                continue;
            };
            match result {
                Ok(location) => {
                    debug!(resolver = name, r = %candidate, "resolved, cancelling peers");
                    race.cancel();
                    set.abort_all();
                    *r = candidate;
                    return Ok(location);
                }
                Err(err) if err.is_not_found() || err.is_cancelled() => {}
                Err(err) => {
                    hard_error.get_or_insert(err);
                }
            }
        }
        race.cancel();
        Err(hard_error.unwrap_or_else(|| miss(r)))
    }
}

// ── Concrete resolvers ───────────────────────────────────────────────────

/// Resolves from the dscache. Misses when the ref is pinned: the cache can
/// confirm aliases but not supply pull locations for absent content.
pub struct DscacheResolver {
    cache: Arc<Dscache>,
}

impl DscacheResolver {
    pub fn new(cache: Arc<Dscache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl Resolver for DscacheResolver {
    fn name(&self) -> &'static str {
        "dscache"
    }

    async fn resolve(&self, _ctx: &CancellationToken, r: &mut Ref) -> Result<String, Error> {
        if r.path.is_some() {
            return Err(miss(r));
        }
        match self.cache.lookup(&r.alias()) {
            Some(entry) if !entry.path.is_empty() => {
                r.path = Some(entry.path);
                if r.profile_id.is_none() {
                    r.profile_id = entry.profile_id;
                }
                Ok(String::new())
            }
            _ => Err(miss(r)),
        }
    }
}

/// Resolves from the repo's ref index.
pub struct RepoResolver {
    repo: Arc<Repo>,
}

impl RepoResolver {
    pub fn new(repo: Arc<Repo>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl Resolver for RepoResolver {
    fn name(&self) -> &'static str {
        "repo"
    }

    async fn resolve(&self, _ctx: &CancellationToken, r: &mut Ref) -> Result<String, Error> {
        if r.path.is_some() {
            return Err(miss(r));
        }
        match self.repo.resolve_alias(&r.alias()) {
            Some(info) if !info.path.is_empty() => {
                r.path = Some(info.path);
                if r.profile_id.is_none() {
                    r.profile_id = info.profile_id;
                }
                Ok(String::new())
            }
            _ => Err(miss(r)),
        }
    }
}

/// Resolves from the logbook. Succeeds with an empty path for refs that are
/// known but have no commits yet; the loader reports those as having no
/// history.
pub struct LogbookResolver {
    logbook: Arc<Logbook>,
}

impl LogbookResolver {
    pub fn new(logbook: Arc<Logbook>) -> Self {
        Self { logbook }
    }
}

#[async_trait]
impl Resolver for LogbookResolver {
    fn name(&self) -> &'static str {
        "logbook"
    }

    async fn resolve(&self, _ctx: &CancellationToken, r: &mut Ref) -> Result<String, Error> {
        if r.path.is_some() {
            return Err(miss(r));
        }
        if !self.logbook.has_ref(&r.alias()) {
            return Err(miss(r));
        }
        r.path = self.logbook.resolve(&r.alias());
        Ok(String::new())
    }
}

/// Resolves through a registry client, returning the location content can
/// be pulled from. Keeps a pinned path, still supplying the location.
pub struct RegistryResolver {
    client: Arc<dyn RegistryClient>,
}

impl RegistryResolver {
    pub fn new(client: Arc<dyn RegistryClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Resolver for RegistryResolver {
    fn name(&self) -> &'static str {
        "registry"
    }

    async fn resolve(&self, ctx: &CancellationToken, r: &mut Ref) -> Result<String, Error> {
        let (path, location) = self.client.resolve(ctx, r).await?;
        if r.path.is_none() {
            r.path = Some(path);
        }
        Ok(location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Test resolver with a scripted outcome and optional delay.
    struct Scripted {
        name: &'static str,
        delay: Duration,
        outcome: Result<(String, String), Error>,
        completed: Arc<AtomicBool>,
    }

    impl Scripted {
        fn ok(
            name: &'static str,
            delay_ms: u64,
            path: &str,
            location: &str,
        ) -> (Arc<dyn Resolver>, Arc<AtomicBool>) {
            let completed = Arc::new(AtomicBool::new(false));
            (
                Arc::new(Self {
                    name,
                    delay: Duration::from_millis(delay_ms),
                    outcome: Ok((path.to_string(), location.to_string())),
                    completed: completed.clone(),
                }),
                completed,
            )
        }

        fn err(
            name: &'static str,
            delay_ms: u64,
            err: Error,
        ) -> (Arc<dyn Resolver>, Arc<AtomicBool>) {
            let completed = Arc::new(AtomicBool::new(false));
            (
                Arc::new(Self {
                    name,
                    delay: Duration::from_millis(delay_ms),
                    outcome: Err(err),
                    completed: completed.clone(),
                }),
                completed,
            )
        }
    }

    #[async_trait]
    impl Resolver for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn resolve(&self, _ctx: &CancellationToken, r: &mut Ref) -> Result<String, Error> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.completed.store(true, Ordering::SeqCst);
            match &self.outcome {
                Ok((path, location)) => {
                    r.path = Some(path.clone());
                    Ok(location.clone())
                }
                Err(err) => Err(err.clone()),
            }
        }
    }

    fn not_found() -> Error {
        Error::not_found("reference not found: x/y")
    }

    #[tokio::test]
    async fn sequential_falls_through_not_found() {
        let (a, _) = Scripted::err("a", 0, not_found());
        let (b, _) = Scripted::ok("b", 0, "/store/1220bb", "");
        let seq = SequentialResolver::new(vec![a, b]);
        let mut r = Ref::new("peer", "cities");
        let location = seq.resolve(&CancellationToken::new(), &mut r).await.unwrap();
        assert_eq!(location, "");
        assert_eq!(r.path.as_deref(), Some("/store/1220bb"));
    }

    #[tokio::test]
    async fn sequential_surfaces_hard_errors_immediately() {
        let (a, _) = Scripted::err("a", 0, Error::internal("disk on fire"));
        let (b, b_done) = Scripted::ok("b", 0, "/store/1220bb", "");
        let seq = SequentialResolver::new(vec![a, b]);
        let mut r = Ref::new("peer", "cities");
        let err = seq.resolve(&CancellationToken::new(), &mut r).await.unwrap_err();
        assert_eq!(err.to_string(), "disk on fire");
        assert!(!b_done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn sequential_all_missing_is_not_found() {
        let (a, _) = Scripted::err("a", 0, not_found());
        let (b, _) = Scripted::err("b", 0, not_found());
        let seq = SequentialResolver::new(vec![a, b]);
        let mut r = Ref::new("peer", "cities");
        assert!(seq
            .resolve(&CancellationToken::new(), &mut r)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn parallel_first_success_wins_and_losers_are_cancelled() {
        // A composite tree: sequential(A, parallel(B, C)). A misses, B
        // succeeds after 50ms, C would succeed at 500ms but must be
        // cancelled before completing.
        let (a, _) = Scripted::err("a", 0, not_found());
        let (b, _) = Scripted::ok("b", 50, "/store/1220bb", "net://b");
        let (c, c_done) = Scripted::ok("c", 500, "/store/1220cc", "net://c");
        let tree = SequentialResolver::new(vec![
            a,
            Arc::new(ParallelResolver::new(vec![b, c])),
        ]);

        let mut r = Ref::new("peer", "cities");
        let location = tree
            .resolve(&CancellationToken::new(), &mut r)
            .await
            .unwrap();
        assert_eq!(location, "net://b");
        assert_eq!(r.path.as_deref(), Some("/store/1220bb"));

        // Give a cancelled C task time to run if it was going to.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!c_done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn parallel_not_found_only_when_all_miss() {
        let (a, _) = Scripted::err("a", 0, not_found());
        let (b, _) = Scripted::err("b", 10, not_found());
        let par = ParallelResolver::new(vec![a, b]);
        let mut r = Ref::new("peer", "cities");
        assert!(par
            .resolve(&CancellationToken::new(), &mut r)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn parallel_prefers_hard_error_over_not_found() {
        let (a, _) = Scripted::err("a", 0, not_found());
        let (b, _) = Scripted::err("b", 10, Error::transient("registry flapping"));
        let par = ParallelResolver::new(vec![a, b]);
        let mut r = Ref::new("peer", "cities");
        let err = par
            .resolve(&CancellationToken::new(), &mut r)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::TransientNetwork);
    }

    #[tokio::test]
    async fn pinned_refs_miss_local_resolvers() {
        let cache = Arc::new(Dscache::open(None).unwrap());
        cache.update(crate::refs::VersionInfo {
            username: "peer".into(),
            name: "cities".into(),
            path: "/store/1220aa".into(),
            ..Default::default()
        });
        let resolver = DscacheResolver::new(cache);
        let mut pinned = Ref::new("peer", "cities").with_path("/store/1220ff");
        assert!(resolver
            .resolve(&CancellationToken::new(), &mut pinned)
            .await
            .unwrap_err()
            .is_not_found());

        let mut unpinned = Ref::new("peer", "cities");
        resolver
            .resolve(&CancellationToken::new(), &mut unpinned)
            .await
            .unwrap();
        assert_eq!(unpinned.path.as_deref(), Some("/store/1220aa"));
    }
}
