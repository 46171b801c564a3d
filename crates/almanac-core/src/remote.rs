//! Remote client: any peer that accepts push/pull of dataset content.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dataset::Dataset;
use crate::error::Error;
use crate::logbook::LogOp;
use crate::refs::Ref;
use crate::registry::Preview;

#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Fetch the dataset version `r` points at from `location`. The returned
    /// dataset carries its version path.
    async fn pull_dataset(
        &self,
        ctx: &CancellationToken,
        r: &Ref,
        location: &str,
    ) -> Result<Dataset, Error>;

    /// Fetch only the oplog for `r`, without any blocks.
    async fn pull_logs(
        &self,
        ctx: &CancellationToken,
        r: &Ref,
        location: &str,
    ) -> Result<Vec<LogOp>, Error>;

    async fn push_dataset(
        &self,
        ctx: &CancellationToken,
        r: &Ref,
        dataset: &Dataset,
        location: &str,
    ) -> Result<(), Error>;

    async fn preview(
        &self,
        ctx: &CancellationToken,
        r: &Ref,
        location: &str,
    ) -> Result<Preview, Error>;
}

// ── HTTP client ──────────────────────────────────────────────────────────

pub struct HttpRemoteClient {
    http: reqwest::Client,
}

impl HttpRemoteClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("building http client");
        Self { http }
    }

    fn dataset_url(location: &str, r: &Ref) -> String {
        let base = location.trim_end_matches('/');
        let mut url = format!("{base}/datasets/{}/{}", r.username, r.name);
        if let Some(path) = &r.path {
            url.push_str(&format!("?path={path}"));
        }
        url
    }
}

impl Default for HttpRemoteClient {
    fn default() -> Self {
        Self::new()
    }
}

fn transport_error(err: reqwest::Error) -> Error {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        Error::transient(format!("remote request failed: {err}"))
    } else {
        Error::internal(format!("remote request failed: {err}"))
    }
}

async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response, Error> {
    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Err(Error::not_found(format!("remote: {what} not found")));
    }
    if !response.status().is_success() {
        return Err(Error::internal(format!(
            "remote returned status {} for {what}",
            response.status()
        )));
    }
    Ok(response)
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn pull_dataset(
        &self,
        ctx: &CancellationToken,
        r: &Ref,
        location: &str,
    ) -> Result<Dataset, Error> {
        if ctx.is_cancelled() {
            return Err(Error::cancelled());
        }
        let url = Self::dataset_url(location, r);
        debug!(url = %url, "pulling dataset");
        let response = self.http.get(&url).send().await.map_err(transport_error)?;
        check(response, &r.alias())
            .await?
            .json::<Dataset>()
            .await
            .map_err(|e| Error::internal(format!("decoding pulled dataset: {e}")))
    }

    async fn pull_logs(
        &self,
        ctx: &CancellationToken,
        r: &Ref,
        location: &str,
    ) -> Result<Vec<LogOp>, Error> {
        if ctx.is_cancelled() {
            return Err(Error::cancelled());
        }
        let base = location.trim_end_matches('/');
        let url = format!("{base}/logs/{}/{}", r.username, r.name);
        let response = self.http.get(&url).send().await.map_err(transport_error)?;
        check(response, &r.alias())
            .await?
            .json::<Vec<LogOp>>()
            .await
            .map_err(|e| Error::internal(format!("decoding pulled logs: {e}")))
    }

    async fn push_dataset(
        &self,
        ctx: &CancellationToken,
        r: &Ref,
        dataset: &Dataset,
        location: &str,
    ) -> Result<(), Error> {
        if ctx.is_cancelled() {
            return Err(Error::cancelled());
        }
        let url = Self::dataset_url(location, r);
        let response = self
            .http
            .post(&url)
            .json(dataset)
            .send()
            .await
            .map_err(transport_error)?;
        check(response, &r.alias()).await.map(|_| ())
    }

    async fn preview(
        &self,
        ctx: &CancellationToken,
        r: &Ref,
        location: &str,
    ) -> Result<Preview, Error> {
        if ctx.is_cancelled() {
            return Err(Error::cancelled());
        }
        let base = location.trim_end_matches('/');
        let url = format!("{base}/preview/{}/{}", r.username, r.name);
        let response = self.http.get(&url).send().await.map_err(transport_error)?;
        check(response, &r.alias())
            .await?
            .json::<Preview>()
            .await
            .map_err(|e| Error::internal(format!("decoding preview: {e}")))
    }
}

// ── In-process double ────────────────────────────────────────────────────

/// In-memory remote for tests. Counts fetches so coalescing can be asserted,
/// and can delay pulls to widen race windows.
pub struct SimRemote {
    datasets: DashMap<String, Dataset>,
    logs: DashMap<String, Vec<LogOp>>,
    pulls: AtomicUsize,
    pushes: AtomicUsize,
    pull_delay: Duration,
    /// First N pulls fail with a transient error, to exercise the retry.
    transient_failures: AtomicUsize,
}

impl SimRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            datasets: DashMap::new(),
            logs: DashMap::new(),
            pulls: AtomicUsize::new(0),
            pushes: AtomicUsize::new(0),
            pull_delay: Duration::ZERO,
            transient_failures: AtomicUsize::new(0),
        })
    }

    pub fn with_pull_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            datasets: DashMap::new(),
            logs: DashMap::new(),
            pulls: AtomicUsize::new(0),
            pushes: AtomicUsize::new(0),
            pull_delay: delay,
            transient_failures: AtomicUsize::new(0),
        })
    }

    /// Make a dataset pullable. The dataset must carry its version path.
    pub fn publish(&self, alias: &str, dataset: Dataset) {
        self.datasets.insert(alias.to_string(), dataset);
    }

    pub fn publish_logs(&self, alias: &str, ops: Vec<LogOp>) {
        self.logs.insert(alias.to_string(), ops);
    }

    pub fn fail_next_pulls(&self, n: usize) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    pub fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    pub fn pushed(&self, alias: &str) -> Option<Dataset> {
        self.datasets.get(alias).map(|entry| entry.clone())
    }
}

#[async_trait]
impl RemoteClient for SimRemote {
    async fn pull_dataset(
        &self,
        ctx: &CancellationToken,
        r: &Ref,
        _location: &str,
    ) -> Result<Dataset, Error> {
        if ctx.is_cancelled() {
            return Err(Error::cancelled());
        }
        if !self.pull_delay.is_zero() {
            tokio::time::sleep(self.pull_delay).await;
        }
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::transient("simulated network failure"));
        }
        self.datasets
            .get(&r.alias())
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::not_found(format!("remote: {} not found", r.alias())))
    }

    async fn pull_logs(
        &self,
        _ctx: &CancellationToken,
        r: &Ref,
        _location: &str,
    ) -> Result<Vec<LogOp>, Error> {
        self.logs
            .get(&r.alias())
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::not_found(format!("remote: {} not found", r.alias())))
    }

    async fn push_dataset(
        &self,
        _ctx: &CancellationToken,
        r: &Ref,
        dataset: &Dataset,
        _location: &str,
    ) -> Result<(), Error> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        self.datasets.insert(r.alias(), dataset.clone());
        Ok(())
    }

    async fn preview(
        &self,
        _ctx: &CancellationToken,
        r: &Ref,
        _location: &str,
    ) -> Result<Preview, Error> {
        let dataset = self
            .datasets
            .get(&r.alias())
            .ok_or_else(|| Error::not_found(format!("remote: {} not found", r.alias())))?;
        let excerpt = dataset
            .readme
            .as_ref()
            .map(|readme| readme.text.chars().take(280).collect())
            .unwrap_or_default();
        Ok(Preview {
            info: crate::refs::VersionInfo {
                username: r.username.clone(),
                name: r.name.clone(),
                path: dataset.path.clone(),
                commit_title: dataset
                    .commit
                    .as_ref()
                    .map(|c| c.title.clone())
                    .unwrap_or_default(),
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
                foreign: true,
                ..Default::default()
            },
            readme_excerpt: excerpt,
        })
    }
}
