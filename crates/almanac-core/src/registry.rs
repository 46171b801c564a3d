//! Registry client: a network service holding discoverable refs.
//!
//! The HTTP client retries transport failures once; everything else is
//! surfaced. [`SimRegistry`] is an in-process double used by tests and by
//! nodes that embed their own registry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Error;
use crate::refs::{Ref, VersionInfo};

/// A dataset preview: the version summary plus a readme excerpt, fetched
/// without pulling any blocks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Preview {
    pub info: VersionInfo,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub readme_excerpt: String,
}

#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Resolve a ref, returning its version path and the network location
    /// content can be pulled from.
    async fn resolve(&self, ctx: &CancellationToken, r: &Ref) -> Result<(String, String), Error>;

    async fn search(
        &self,
        ctx: &CancellationToken,
        query: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<VersionInfo>, Error>;

    async fn preview(&self, ctx: &CancellationToken, r: &Ref) -> Result<Preview, Error>;

    fn location(&self) -> &str;
}

// ── HTTP client ──────────────────────────────────────────────────────────

pub struct HttpRegistryClient {
    base: String,
    http: reqwest::Client,
}

impl HttpRegistryClient {
    pub fn new(base: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("building http client");
        Self {
            base: base.trim_end_matches('/').to_string(),
            http,
        }
    }

    /// GET with a single retry on transient transport errors.
    async fn get_json<T: DeserializeOwned>(
        &self,
        ctx: &CancellationToken,
        url: &str,
    ) -> Result<T, Error> {
        let mut last = None;
        for attempt in 0..2 {
            if ctx.is_cancelled() {
                return Err(Error::cancelled());
            }
            match self.try_get(url).await {
                Ok(value) => return Ok(value),
                Err(err) if err.kind() == crate::error::ErrorKind::TransientNetwork => {
                    debug!(url, attempt, error = %err, "registry request failed, retrying");
                    last = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last.unwrap_or_else(|| Error::transient("registry unreachable")))
    }

    async fn try_get<T: DeserializeOwned>(&self, url: &str) -> Result<T, Error> {
        let response = self.http.get(url).send().await.map_err(transport_error)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::not_found(format!("registry: {url} not found")));
        }
        if !response.status().is_success() {
            return Err(Error::internal(format!(
                "registry returned status {}",
                response.status()
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| Error::internal(format!("decoding registry response: {e}")))
    }
}

fn transport_error(err: reqwest::Error) -> Error {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        Error::transient(format!("registry request failed: {err}"))
    } else {
        Error::internal(format!("registry request failed: {err}"))
    }
}

#[derive(Deserialize)]
struct ResolveResponse {
    path: String,
    #[serde(default)]
    location: String,
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn resolve(&self, ctx: &CancellationToken, r: &Ref) -> Result<(String, String), Error> {
        let url = format!("{}/refs/{}/{}", self.base, r.username, r.name);
        let resolved: ResolveResponse = self.get_json(ctx, &url).await?;
        let location = if resolved.location.is_empty() {
            self.base.clone()
        } else {
            resolved.location
        };
        Ok((resolved.path, location))
    }

    async fn search(
        &self,
        ctx: &CancellationToken,
        query: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<VersionInfo>, Error> {
        let url = format!(
            "{}/search?q={}&limit={limit}&offset={offset}",
            self.base,
            urlencode(query)
        );
        self.get_json(ctx, &url).await
    }

    async fn preview(&self, ctx: &CancellationToken, r: &Ref) -> Result<Preview, Error> {
        let url = format!("{}/preview/{}/{}", self.base, r.username, r.name);
        self.get_json(ctx, &url).await
    }

    fn location(&self) -> &str {
        &self.base
    }
}

fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

// ── Disabled registry ────────────────────────────────────────────────────

/// Used when no registry is configured: every lookup misses.
pub struct NullRegistry;

#[async_trait]
impl RegistryClient for NullRegistry {
    async fn resolve(&self, _ctx: &CancellationToken, r: &Ref) -> Result<(String, String), Error> {
        Err(Error::not_found(format!("reference not found: {}", r.alias())))
    }

    async fn search(
        &self,
        _ctx: &CancellationToken,
        _query: &str,
        _limit: usize,
        _offset: usize,
    ) -> Result<Vec<VersionInfo>, Error> {
        Ok(Vec::new())
    }

    async fn preview(&self, _ctx: &CancellationToken, r: &Ref) -> Result<Preview, Error> {
        Err(Error::not_found(format!("reference not found: {}", r.alias())))
    }

    fn location(&self) -> &str {
        ""
    }
}

// ── In-process double ────────────────────────────────────────────────────

/// In-memory registry for tests and embedded use.
pub struct SimRegistry {
    location: String,
    refs: DashMap<String, (String, String)>,
    index: DashMap<String, VersionInfo>,
}

impl SimRegistry {
    pub fn new(location: &str) -> Arc<Self> {
        Arc::new(Self {
            location: location.to_string(),
            refs: DashMap::new(),
            index: DashMap::new(),
        })
    }

    /// Make a ref discoverable at `path`, pullable from `location`.
    pub fn announce(&self, alias: &str, path: &str, location: &str) {
        self.refs
            .insert(alias.to_string(), (path.to_string(), location.to_string()));
    }

    pub fn index_info(&self, info: VersionInfo) {
        self.index.insert(info.alias(), info);
    }
}

#[async_trait]
impl RegistryClient for SimRegistry {
    async fn resolve(&self, ctx: &CancellationToken, r: &Ref) -> Result<(String, String), Error> {
        if ctx.is_cancelled() {
            return Err(Error::cancelled());
        }
        self.refs
            .get(&r.alias())
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::not_found(format!("reference not found: {}", r.alias())))
    }

    async fn search(
        &self,
        _ctx: &CancellationToken,
        query: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<VersionInfo>, Error> {
        let needle = query.to_ascii_lowercase();
        let mut hits: Vec<VersionInfo> = self
            .index
            .iter()
            .filter(|entry| {
                entry.key().to_ascii_lowercase().contains(&needle)
                    || entry.value().commit_title.to_ascii_lowercase().contains(&needle)
            })
            .map(|entry| entry.value().clone())
            .collect();
        hits.sort_by(|a, b| a.alias().cmp(&b.alias()));
        Ok(hits.into_iter().skip(offset).take(limit).collect())
    }

    async fn preview(&self, _ctx: &CancellationToken, r: &Ref) -> Result<Preview, Error> {
        self.index
            .get(&r.alias())
            .map(|entry| Preview {
                info: entry.value().clone(),
                readme_excerpt: String::new(),
            })
            .ok_or_else(|| Error::not_found(format!("reference not found: {}", r.alias())))
    }

    fn location(&self) -> &str {
        &self.location
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sim_registry_resolves_announced_refs() {
        let registry = SimRegistry::new("sim://registry");
        registry.announce("peer/cities", "/store/1220aa", "sim://remote");
        let ctx = CancellationToken::new();
        let (path, location) = registry
            .resolve(&ctx, &Ref::new("peer", "cities"))
            .await
            .unwrap();
        assert_eq!(path, "/store/1220aa");
        assert_eq!(location, "sim://remote");

        let err = registry
            .resolve(&ctx, &Ref::new("peer", "unknown"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn sim_registry_search_matches_alias_and_title() {
        let registry = SimRegistry::new("sim://registry");
        registry.index_info(VersionInfo {
            username: "peer".into(),
            name: "city_budgets".into(),
            commit_title: "annual budgets".into(),
            ..Default::default()
        });
        registry.index_info(VersionInfo {
            username: "peer".into(),
            name: "weather".into(),
            ..Default::default()
        });
        let ctx = CancellationToken::new();
        let hits = registry.search(&ctx, "budget", 10, 0).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "city_budgets");
    }

    #[test]
    fn urlencode_escapes_reserved_bytes() {
        assert_eq!(urlencode("a b/c"), "a%20b%2Fc");
        assert_eq!(urlencode("plain-text_1.2~"), "plain-text_1.2~");
    }
}
