//! The instance: process-wide construction, dispatch entry points, and
//! teardown.
//!
//! Subsystems are constructed in dependency order (config, identity, bus,
//! repo, logbook, dscache, workspace, registry, remote, p2p, loader, then
//! method registration). Teardown reverses that order; `done()` resolves
//! only after every subsystem has released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use almanac_auth::{token_key_id, verify_token, KeyPair, KeyStore, Profile};
use almanac_events::Bus;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::dscache::Dscache;
use crate::error::Error;
use crate::fsi::Fsi;
use crate::loader::Loader;
use crate::logbook::Logbook;
use crate::methods;
use crate::p2p::P2pNode;
use crate::profiles::ProfileStore;
use crate::registry::{HttpRegistryClient, NullRegistry, RegistryClient};
use crate::remote::{HttpRemoteClient, RemoteClient};
use crate::repo::Repo;
use crate::scope::{Scope, Subsystems};

/// Builder for an [`Instance`]; lets tests inject clocks, keys, and network
/// clients.
pub struct InstanceBuilder {
    config: Config,
    clock: Clock,
    keypair: Option<KeyPair>,
    registry: Option<Arc<dyn RegistryClient>>,
    remote: Option<Arc<dyn RemoteClient>>,
}

impl InstanceBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            clock: Clock::system(),
            keypair: None,
            registry: None,
            remote: None,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_keypair(mut self, keypair: KeyPair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    pub fn with_registry(mut self, registry: Arc<dyn RegistryClient>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteClient>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn open(self) -> Result<Instance, Error> {
        Instance::construct(self)
    }
}

pub struct Instance {
    subs: Arc<Subsystems>,
    dispatcher: Arc<Dispatcher>,
    root: CancellationToken,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    shut: AtomicBool,
}

impl Instance {
    /// Open an instance from config with production collaborators.
    pub fn open(config: Config) -> Result<Self, Error> {
        InstanceBuilder::new(config).open()
    }

    pub fn builder(config: Config) -> InstanceBuilder {
        InstanceBuilder::new(config)
    }

    fn construct(builder: InstanceBuilder) -> Result<Self, Error> {
        let config = builder.config;
        let clock = builder.clock;

        // Identity: the owner profile derives from the configured key pair.
        let keypair = match (&builder.keypair, &config.identity.private_key_pem) {
            (Some(pair), _) => pair.clone(),
            (None, Some(private_pem)) => {
                let public_pem = config.identity.public_key_pem.as_deref().ok_or_else(|| {
                    Error::validation("identity: public_key_pem is required with private_key_pem")
                })?;
                KeyPair::from_pems(private_pem, public_pem)?
            }
            (None, None) => {
                warn!("no identity keys configured, using the built-in development key pair");
                KeyPair::test_fixture()
            }
        };
        let keystore = Arc::new(KeyStore::new());
        keystore.insert(keypair.clone());
        let owner = Profile::new(&config.identity.peername, &keypair, clock.now());
        let profiles = Arc::new(ProfileStore::new(owner.clone()));

        // Event bus, stamped by the injected clock.
        let bus_clock = clock.clone();
        let bus = Bus::with_now(move || {
            bus_clock.now().timestamp_nanos_opt().unwrap_or_default()
        });

        // Storage: repo, logbook, dscache, workspace.
        let root_dir = config.repo.path.clone();
        let repo = Arc::new(Repo::open(root_dir.as_deref())?);
        let logbook = Arc::new(Logbook::open(
            root_dir.as_ref().map(|dir| dir.join("logbook.jsonl")),
            clock.clone(),
        )?);
        let dscache = Arc::new(Dscache::open(
            root_dir.as_ref().map(|dir| dir.join("dscache.json")),
        )?);
        let fsi = Arc::new(Fsi::new(dscache.clone()));

        // Network clients.
        let registry: Arc<dyn RegistryClient> = match &builder.registry {
            Some(client) => client.clone(),
            None => match &config.registry.location {
                Some(location) => Arc::new(HttpRegistryClient::new(location)),
                None => Arc::new(NullRegistry),
            },
        };
        let remote: Arc<dyn RemoteClient> = match &builder.remote {
            Some(client) => client.clone(),
            None => Arc::new(HttpRemoteClient::new()),
        };
        let p2p = config.p2p.enabled.then(P2pNode::new);

        // Resolution and loading.
        let loader = Arc::new(Loader::new(
            repo.clone(),
            logbook.clone(),
            dscache.clone(),
            registry.clone(),
            remote.clone(),
            p2p.clone(),
            bus.clone(),
        ));

        let subs = Arc::new(Subsystems {
            config,
            clock,
            bus,
            repo,
            logbook,
            dscache,
            fsi,
            registry,
            remote,
            p2p,
            loader,
            keystore,
            profiles,
        });

        let mut dispatcher = Dispatcher::new();
        methods::register_all(&mut dispatcher);

        let (done_tx, done_rx) = watch::channel(false);
        info!(owner = %owner.peername, profile_id = %owner.id, "instance ready");
        Ok(Self {
            subs,
            dispatcher: Arc::new(dispatcher),
            root: CancellationToken::new(),
            done_tx,
            done_rx,
            shut: AtomicBool::new(false),
        })
    }

    pub fn subsystems(&self) -> &Arc<Subsystems> {
        &self.subs
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn bus(&self) -> Bus {
        self.subs.bus.clone()
    }

    pub fn owner(&self) -> Profile {
        self.subs.profiles.owner()
    }

    /// The root cancellation token; children are cancelled at shutdown.
    pub fn root_token(&self) -> &CancellationToken {
        &self.root
    }

    fn scope_for(&self, profile: Profile, method: &str, session_id: &str) -> Scope {
        Scope::new(
            self.subs.clone(),
            profile,
            method,
            session_id,
            self.root.child_token(),
        )
    }

    /// In-process dispatch as the owner.
    pub async fn dispatch(&self, name: &str, params: Value) -> Result<DispatchOutcome, Error> {
        self.dispatch_session(name, params, "").await
    }

    /// In-process dispatch as the owner, attributed to a client session.
    pub async fn dispatch_session(
        &self,
        name: &str,
        params: Value,
        session_id: &str,
    ) -> Result<DispatchOutcome, Error> {
        let scope = self.scope_for(self.owner(), name, session_id);
        self.dispatcher.dispatch(scope, name, params).await
    }

    /// Dispatch over the HTTP transport: verifies the bearer token (when
    /// present) into a delegated profile and refuses `deny_rpc` methods.
    pub async fn dispatch_http(
        &self,
        name: &str,
        params: Value,
        token: Option<&str>,
        session_id: &str,
    ) -> Result<DispatchOutcome, Error> {
        if let Some(spec) = self.dispatcher.lookup(name) {
            if spec.attrs().deny_rpc {
                return Err(Error::not_found(format!("method not found: {name}")));
            }
        }
        let profile = match token {
            Some(token) => self.verify_token_profile(token)?,
            None => self.owner(),
        };
        let scope = self.scope_for(profile, name, session_id);
        self.dispatcher.dispatch(scope, name, params).await
    }

    /// Verify a bearer token against its issuer's stored public key and
    /// return the granted profile.
    pub fn verify_token_profile(&self, token: &str) -> Result<Profile, Error> {
        let key_id = token_key_id(token)?;
        let pair = self
            .subs
            .keystore
            .get(&key_id)
            .map_err(|_| Error::unauthorized("unknown token issuer"))?;
        let claims = verify_token(token, &pair)?;
        self.subs
            .profiles
            .get_by_id(&claims.sub)
            .map_err(|_| Error::unauthorized("token subject is not a known profile"))
    }

    /// Cancel all in-flight work and release subsystems in reverse
    /// construction order.
    pub async fn shutdown(&self) {
        if self.shut.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("instance shutting down");
        self.root.cancel();

        // Reverse order: loader and network clients hold no resources;
        // persistent stores flush, then the bus drops its subscribers.
        if let Err(err) = self.subs.dscache.persist() {
            warn!(error = %err, "dscache flush failed during shutdown");
        }
        if let Err(err) = self.subs.logbook.close() {
            warn!(error = %err, "logbook close failed during shutdown");
        }
        if let Err(err) = self.subs.repo.persist_refs() {
            warn!(error = %err, "ref index flush failed during shutdown");
        }
        self.subs.bus.clear().await;
        let _ = self.done_tx.send(true);
    }

    /// Resolves after shutdown has released every subsystem.
    pub async fn done(&self) {
        let mut rx = self.done_rx.clone();
        let _ = rx.wait_for(|done| *done).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_instance() -> Instance {
        Instance::builder(Config::default())
            .with_keypair(KeyPair::test_fixture())
            .open()
            .unwrap()
    }

    #[tokio::test]
    async fn open_dispatch_shutdown() {
        let instance = test_instance();
        let outcome = instance.dispatch("profile.get", Value::Null).await.unwrap();
        assert_eq!(outcome.value["peername"], "peer");

        instance.shutdown().await;
        instance.done().await;
        // Idempotent.
        instance.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_cancels_request_contexts() {
        let instance = test_instance();
        let child = instance.root_token().child_token();
        assert!(!child.is_cancelled());
        instance.shutdown().await;
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn deny_rpc_methods_are_hidden_over_http() {
        let instance = test_instance();
        // Works in process.
        assert!(instance.dispatch("log.rawlogbook", Value::Null).await.is_ok());
        // 404s over the HTTP transport.
        let err = instance
            .dispatch_http("log.rawlogbook", Value::Null, None, "")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn http_dispatch_verifies_bearer_tokens() {
        let instance = test_instance();
        let outcome = instance
            .dispatch(
                "access.createauthtoken",
                json!({"granteeUsername": "peer"}),
            )
            .await
            .unwrap();
        let token = outcome.value.as_str().unwrap().to_string();

        let ok = instance
            .dispatch_http("profile.get", Value::Null, Some(&token), "")
            .await
            .unwrap();
        assert_eq!(ok.value["peername"], "peer");

        let err = instance
            .dispatch_http("profile.get", Value::Null, Some("not-a-token"), "")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Unauthorized);
    }
}
