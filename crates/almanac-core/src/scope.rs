//! Per-call scopes.
//!
//! A scope is built by the dispatcher for one call and lives exactly that
//! long. It carries the request's cancellation token, the active profile,
//! shared read handles to every subsystem, and a cursor factory bound to
//! the invoked method's name.

use std::sync::Arc;

use almanac_auth::{KeyStore, Profile};
use almanac_events::{Bus, EventType};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::clock::Clock;
use crate::config::Config;
use crate::cursor::Cursor;
use crate::dscache::Dscache;
use crate::fsi::Fsi;
use crate::loader::Loader;
use crate::logbook::Logbook;
use crate::p2p::P2pNode;
use crate::profiles::ProfileStore;
use crate::registry::RegistryClient;
use crate::remote::RemoteClient;
use crate::repo::Repo;

/// Shared handles to every subsystem. Owned by the instance; scopes hold a
/// shared reference for the duration of one call.
pub struct Subsystems {
    pub config: Config,
    pub clock: Clock,
    pub bus: Bus,
    pub repo: Arc<Repo>,
    pub logbook: Arc<Logbook>,
    pub dscache: Arc<Dscache>,
    pub fsi: Arc<Fsi>,
    pub registry: Arc<dyn RegistryClient>,
    pub remote: Arc<dyn RemoteClient>,
    pub p2p: Option<Arc<P2pNode>>,
    pub loader: Arc<Loader>,
    pub keystore: Arc<KeyStore>,
    pub profiles: Arc<ProfileStore>,
}

#[derive(Clone)]
pub struct Scope {
    ctx: CancellationToken,
    profile: Profile,
    method: String,
    session_id: String,
    subs: Arc<Subsystems>,
}

impl Scope {
    pub fn new(
        subs: Arc<Subsystems>,
        profile: Profile,
        method: &str,
        session_id: &str,
        ctx: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            profile,
            method: method.to_string(),
            session_id: session_id.to_string(),
            subs,
        }
    }

    pub fn ctx(&self) -> &CancellationToken {
        &self.ctx
    }

    /// The profile this call acts as: the owner, or a delegated profile
    /// carried in by a verified access token.
    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn active_username(&self) -> &str {
        &self.profile.peername
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &Config {
        &self.subs.config
    }

    pub fn clock(&self) -> &Clock {
        &self.subs.clock
    }

    pub fn bus(&self) -> &Bus {
        &self.subs.bus
    }

    pub fn repo(&self) -> &Arc<Repo> {
        &self.subs.repo
    }

    pub fn logbook(&self) -> &Arc<Logbook> {
        &self.subs.logbook
    }

    pub fn dscache(&self) -> &Arc<Dscache> {
        &self.subs.dscache
    }

    pub fn fsi(&self) -> &Arc<Fsi> {
        &self.subs.fsi
    }

    pub fn registry(&self) -> &Arc<dyn RegistryClient> {
        &self.subs.registry
    }

    pub fn remote(&self) -> &Arc<dyn RemoteClient> {
        &self.subs.remote
    }

    pub fn loader(&self) -> &Arc<Loader> {
        &self.subs.loader
    }

    pub fn keystore(&self) -> &Arc<KeyStore> {
        &self.subs.keystore
    }

    pub fn profiles(&self) -> &Arc<ProfileStore> {
        &self.subs.profiles
    }

    /// Publish an event attributed to this call's session.
    pub async fn publish(&self, typ: EventType, payload: serde_json::Value) {
        if self.session_id.is_empty() {
            self.subs.bus.publish(&self.ctx, typ, payload).await;
        } else {
            self.subs
                .bus
                .publish_for_session(&self.ctx, &self.session_id, typ, payload)
                .await;
        }
    }

    /// Cursor factory: yields a next-page cursor only when the page came
    /// back full and there are next-page params, otherwise signals that
    /// iteration is complete.
    pub fn make_cursor<P: Serialize>(
        &self,
        next_params: Option<&P>,
        items_returned: usize,
        page_size: usize,
    ) -> Option<Cursor> {
        let next = next_params?;
        if page_size == 0 || items_returned != page_size {
            return None;
        }
        match Cursor::new(&self.method, next) {
            Ok(cursor) => Some(cursor),
            Err(err) => {
                warn!(method = %self.method, error = %err, "could not encode cursor");
                None
            }
        }
    }
}
