//! The method dispatcher: a single entry point between method-group handles
//! and their implementations.
//!
//! Implementations are registered as name/closure pairs at construction
//! time (the trampoline option; semantics match a reflective registry). The
//! dispatcher owns the parameter pipeline: nil check, deserialisation,
//! default filling, `me` substitution, default-source injection, and
//! validation, so methods stay free of wiring code.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cursor::Cursor;
use crate::error::Error;
use crate::scope::Scope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVerb {
    Get,
    Post,
}

/// Per-method metadata: HTTP binding, default source, and transport policy.
#[derive(Debug, Clone, Copy)]
pub struct AttributeSet {
    /// HTTP route, when the method is exposed over HTTP.
    pub endpoint: Option<&'static str>,
    pub verb: HttpVerb,
    /// Filled into the params' `source` field when the caller left it empty.
    pub default_source: &'static str,
    /// Local transport only; never routed over HTTP.
    pub deny_rpc: bool,
}

impl AttributeSet {
    pub const fn get(endpoint: &'static str) -> Self {
        Self {
            endpoint: Some(endpoint),
            verb: HttpVerb::Get,
            default_source: "",
            deny_rpc: false,
        }
    }

    pub const fn post(endpoint: &'static str) -> Self {
        Self {
            endpoint: Some(endpoint),
            verb: HttpVerb::Post,
            default_source: "",
            deny_rpc: false,
        }
    }

    /// No HTTP route, but reachable through in-process dispatch.
    pub const fn unrouted() -> Self {
        Self {
            endpoint: None,
            verb: HttpVerb::Post,
            default_source: "",
            deny_rpc: false,
        }
    }

    /// Local transport only.
    pub const fn local_only() -> Self {
        Self {
            endpoint: None,
            verb: HttpVerb::Post,
            default_source: "",
            deny_rpc: true,
        }
    }

    pub const fn with_default_source(mut self, source: &'static str) -> Self {
        self.default_source = source;
        self
    }
}

/// Contract for method parameter structs.
///
/// The dispatcher drives these hooks in order: defaults, `me` substitution,
/// default-source injection, then validation.
pub trait MethodParams: DeserializeOwned + Serialize + Send + Sync + 'static {
    /// Whether a nil params value is acceptable for this method.
    const ALLOW_NULL: bool = false;

    /// Fill zero-valued fields with their defaults.
    fn set_nonzero_defaults(&mut self) {}

    /// Reject structurally invalid parameters.
    fn validate(&self) -> Result<(), Error> {
        Ok(())
    }

    /// The source hint, for methods that have one.
    fn source(&self) -> Option<&str> {
        None
    }

    fn set_source(&mut self, _source: &str) {}

    /// Replace `me` in any ref-bearing fields with the active username.
    fn substitute_me(&mut self, _active_username: &str) {}
}

/// Params for methods that take no input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmptyParams {}

impl MethodParams for EmptyParams {
    const ALLOW_NULL: bool = true;
}

/// The result of one dispatched call: the serialised method result plus an
/// optional next-page cursor.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub value: Value,
    pub cursor: Option<Cursor>,
}

type MethodFuture = Pin<Box<dyn Future<Output = Result<DispatchOutcome, Error>> + Send>>;
type MethodFn = Arc<dyn Fn(Scope, Value) -> MethodFuture + Send + Sync>;

pub struct MethodSpec {
    name: String,
    attrs: AttributeSet,
    allow_null: bool,
    func: MethodFn,
}

impl MethodSpec {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attrs(&self) -> &AttributeSet {
        &self.attrs
    }
}

/// The method registry. Names are `group.method`, matched case-insensitively.
#[derive(Default)]
pub struct Dispatcher {
    methods: HashMap<String, MethodSpec>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plain method.
    pub fn register<P, R, F, Fut>(&mut self, name: &'static str, attrs: AttributeSet, f: F)
    where
        P: MethodParams,
        R: Serialize + Send + 'static,
        F: Fn(Scope, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Error>> + Send + 'static,
    {
        self.register_raw::<P, _, _>(name, attrs, move |scope, params| {
            let fut = f(scope, params);
            async move {
                Ok(DispatchOutcome {
                    value: serde_json::to_value(fut.await?)?,
                    cursor: None,
                })
            }
        });
    }

    /// Register a paginated method; the implementation returns the result
    /// plus an optional next-page cursor made with `scope.make_cursor`.
    pub fn register_cursor<P, R, F, Fut>(&mut self, name: &'static str, attrs: AttributeSet, f: F)
    where
        P: MethodParams,
        R: Serialize + Send + 'static,
        F: Fn(Scope, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(R, Option<Cursor>), Error>> + Send + 'static,
    {
        self.register_raw::<P, _, _>(name, attrs, move |scope, params| {
            let fut = f(scope, params);
            async move {
                let (result, cursor) = fut.await?;
                Ok(DispatchOutcome {
                    value: serde_json::to_value(result)?,
                    cursor,
                })
            }
        });
    }

    fn register_raw<P, F, Fut>(&mut self, name: &'static str, attrs: AttributeSet, f: F)
    where
        P: MethodParams,
        F: Fn(Scope, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<DispatchOutcome, Error>> + Send + 'static,
    {
        let f = Arc::new(f);
        let default_source = attrs.default_source;
        let func: MethodFn = Arc::new(move |scope: Scope, raw: Value| {
            let f = f.clone();
            Box::pin(async move {
                let raw = if raw.is_null() {
                    Value::Object(Default::default())
                } else {
                    raw
                };
                let mut params: P = serde_json::from_value(raw)
                    .map_err(|e| Error::validation(format!("invalid parameters: {e}")))?;
                params.set_nonzero_defaults();
                params.substitute_me(scope.active_username());
                if !default_source.is_empty() && params.source().is_some_and(|s| s.is_empty()) {
                    params.set_source(default_source);
                }
                params.validate()?;
                f(scope, params).await
            })
        });
        let key = name.to_ascii_lowercase();
        let existing = self.methods.insert(
            key,
            MethodSpec {
                name: name.to_string(),
                attrs,
                allow_null: P::ALLOW_NULL,
                func,
            },
        );
        assert!(existing.is_none(), "method {name} registered twice");
    }

    pub fn lookup(&self, name: &str) -> Option<&MethodSpec> {
        self.methods.get(&name.to_ascii_lowercase())
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodSpec> {
        self.methods.values()
    }

    /// Dispatch a call. The scope was built by the instance for exactly
    /// this invocation.
    pub async fn dispatch(
        &self,
        scope: Scope,
        name: &str,
        params: Value,
    ) -> Result<DispatchOutcome, Error> {
        let spec = self
            .lookup(name)
            .ok_or_else(|| Error::not_found(format!("method not found: {name}")))?;
        if params.is_null() && !spec.allow_null {
            return Err(Error::validation(format!("param is nil for method {name}")));
        }
        (spec.func)(scope, params).await
    }
}
