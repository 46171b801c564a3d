//! Feature flags, backed by the config file's `features` table.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::dispatch::{AttributeSet, Dispatcher, EmptyParams, MethodParams};
use crate::error::Error;
use crate::scope::Scope;

pub fn register(d: &mut Dispatcher) {
    d.register("features.list", AttributeSet::get("/features"), list);
    d.register("features.enabled", AttributeSet::unrouted(), enabled);
}

pub async fn list(scope: Scope, _params: EmptyParams) -> Result<BTreeMap<String, bool>, Error> {
    Ok(scope.config().features.clone())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureParams {
    pub flag: String,
}

impl MethodParams for FeatureParams {
    fn validate(&self) -> Result<(), Error> {
        if self.flag.is_empty() {
            return Err(Error::validation("flag name is required"));
        }
        Ok(())
    }
}

/// Unknown flags read as disabled, not as errors.
pub async fn enabled(scope: Scope, params: FeatureParams) -> Result<bool, Error> {
    Ok(scope.config().feature_enabled(&params.flag))
}
