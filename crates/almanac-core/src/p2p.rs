//! Peer-to-peer node stub.
//!
//! The wire protocol lives in an external collaborator; this node tracks
//! refs announced by connected peers and exposes them as a resolver. When
//! disabled it is simply never constructed.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::refs::Ref;
use crate::resolver::Resolver;

pub struct P2pNode {
    /// alias -> (version path, peer location)
    announced: DashMap<String, (String, String)>,
}

impl P2pNode {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            announced: DashMap::new(),
        })
    }

    /// Record a ref announced by a peer.
    pub fn announce(&self, alias: &str, path: &str, location: &str) {
        self.announced
            .insert(alias.to_string(), (path.to_string(), location.to_string()));
    }

    pub fn lookup(&self, alias: &str) -> Option<(String, String)> {
        self.announced.get(alias).map(|entry| entry.clone())
    }
}

pub struct P2pResolver {
    node: Arc<P2pNode>,
}

impl P2pResolver {
    pub fn new(node: Arc<P2pNode>) -> Self {
        Self { node }
    }
}

#[async_trait]
impl Resolver for P2pResolver {
    fn name(&self) -> &'static str {
        "p2p"
    }

    async fn resolve(&self, ctx: &CancellationToken, r: &mut Ref) -> Result<String, Error> {
        if ctx.is_cancelled() {
            return Err(Error::cancelled());
        }
        match self.node.lookup(&r.alias()) {
            Some((path, location)) => {
                if r.path.is_none() {
                    r.path = Some(path);
                }
                Ok(location)
            }
            None => Err(Error::not_found(format!(
                "reference not found: {}",
                r.alias()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_announced_refs() {
        let node = P2pNode::new();
        node.announce("peer/cities", "/store/1220aa", "p2p://peer-7");
        let resolver = P2pResolver::new(node);
        let mut r = Ref::new("peer", "cities");
        let location = resolver
            .resolve(&CancellationToken::new(), &mut r)
            .await
            .unwrap();
        assert_eq!(location, "p2p://peer-7");
        assert_eq!(r.path.as_deref(), Some("/store/1220aa"));
    }

    #[tokio::test]
    async fn unknown_refs_miss() {
        let resolver = P2pResolver::new(P2pNode::new());
        let mut r = Ref::new("peer", "cities");
        assert!(resolver
            .resolve(&CancellationToken::new(), &mut r)
            .await
            .unwrap_err()
            .is_not_found());
    }
}
