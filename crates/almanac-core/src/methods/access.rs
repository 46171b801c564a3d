//! Access-token issuance.

use almanac_auth::{create_token, DEFAULT_TOKEN_TTL_SECONDS};
use serde::{Deserialize, Serialize};

use crate::dispatch::{AttributeSet, Dispatcher, MethodParams};
use crate::error::Error;
use crate::scope::Scope;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CreateAuthTokenParams {
    pub grantee_username: String,
    pub grantee_profile_id: String,
    /// Token lifetime in seconds; defaults to two hours.
    pub ttl_seconds: i64,
}

impl MethodParams for CreateAuthTokenParams {
    fn set_nonzero_defaults(&mut self) {
        if self.ttl_seconds == 0 {
            self.ttl_seconds = DEFAULT_TOKEN_TTL_SECONDS;
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.grantee_username.is_empty() && self.grantee_profile_id.is_empty() {
            return Err(Error::validation(
                "either a grantee username or a grantee profile id is required",
            ));
        }
        if self.ttl_seconds < 0 {
            return Err(Error::validation("ttl must be positive"));
        }
        Ok(())
    }

    fn substitute_me(&mut self, active_username: &str) {
        if self.grantee_username == "me" {
            self.grantee_username = active_username.to_string();
        }
    }
}

/// Issue a signed auth token for the grantee. Requires the grantee's
/// private key to be present in the key store.
pub async fn create_auth_token(
    scope: Scope,
    params: CreateAuthTokenParams,
) -> Result<String, Error> {
    let profile = if !params.grantee_profile_id.is_empty() {
        scope.profiles().get_by_id(&params.grantee_profile_id)?
    } else {
        scope.profiles().get_by_username(&params.grantee_username)?
    };
    let pair = scope.keystore().get(&profile.id)?;
    let token = create_token(&pair, &profile.id, params.ttl_seconds, scope.clock().now())?;
    Ok(token)
}

pub fn register(d: &mut Dispatcher) {
    d.register(
        "access.createauthtoken",
        AttributeSet::post("/access/token"),
        create_auth_token,
    );
}
