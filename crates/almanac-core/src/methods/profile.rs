//! Profile methods.

use std::collections::BTreeSet;

use almanac_auth::Profile;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dispatch::{AttributeSet, Dispatcher, EmptyParams, MethodParams};
use crate::error::Error;
use crate::refs::{validate_name, Ref};
use crate::scope::Scope;

pub fn register(d: &mut Dispatcher) {
    d.register("profile.get", AttributeSet::get("/profile"), get);
    d.register("profile.set", AttributeSet::post("/profile"), set);
}

/// The owner profile, public fields only.
pub async fn get(scope: Scope, _params: EmptyParams) -> Result<Profile, Error> {
    Ok(scope.profiles().owner())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SetProfileParams {
    pub peername: String,
    pub email: Option<String>,
    pub description: Option<String>,
}

impl MethodParams for SetProfileParams {
    fn validate(&self) -> Result<(), Error> {
        if !self.peername.is_empty() {
            validate_name(&self.peername).map_err(|e| e.context("peername"))?;
        }
        Ok(())
    }
}

/// Update the owner profile.
///
/// A peername change renames every ref the owner holds: rename ops in the
/// logbook, the repo's ref index, the dscache, and any workspace link
/// files, so datasets stay reachable under the new identity.
pub async fn set(scope: Scope, params: SetProfileParams) -> Result<Profile, Error> {
    let owner = scope.profiles().owner();
    if !params.peername.is_empty() && params.peername != owner.peername {
        rename_owner_refs(&scope, &owner.peername, &params.peername).await?;
        scope
            .profiles()
            .set_owner_peername(&params.peername, scope.clock().now());
        info!(from = %owner.peername, to = %params.peername, "owner peername changed");
    }

    let mut owner = scope.profiles().owner();
    if params.email.is_some() || params.description.is_some() {
        if params.email.is_some() {
            owner.email = params.email.clone();
        }
        if params.description.is_some() {
            owner.description = params.description.clone();
        }
        owner.updated = scope.clock().now();
        scope.profiles().put(owner.clone());
    }
    Ok(owner)
}

/// Move every ref held under `old` to `new`. The logbook stays append-only:
/// each dataset gets a rename op rather than rewritten history.
async fn rename_owner_refs(scope: &Scope, old: &str, new: &str) -> Result<(), Error> {
    let mut names: BTreeSet<String> = BTreeSet::new();
    for op in scope.logbook().raw() {
        if op.username == old {
            names.insert(op.name.clone());
        }
    }
    for entry in scope.repo().list_refs(usize::MAX, 0) {
        if entry.username == old {
            names.insert(entry.name);
        }
    }

    for name in names {
        let from = Ref::new(old, &name);
        let to = Ref::new(new, &name);
        let _guard = scope.logbook().lock_ref(&from.alias()).await;

        // Names seen only in superseded ops (earlier renames, full removals)
        // have nothing left to move.
        if scope.logbook().has_ref(&from.alias()) {
            scope.logbook().write_rename(&from, &to)?;
        }
        if scope.repo().resolve_alias(&from.alias()).is_some() {
            scope.repo().rename_ref(&from.alias(), new, &name)?;
        }
        scope.dscache().rename(&from.alias(), new, &name);
        if let Some(dir) = scope.fsi().linked_dir(&to.alias()) {
            scope.fsi().create_link(&to.alias(), &dir)?;
        }
    }
    scope.dscache().persist()?;
    Ok(())
}
