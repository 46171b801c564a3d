//! History and logbook access.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cursor::Cursor;
use crate::dispatch::{AttributeSet, Dispatcher, EmptyParams, MethodParams};
use crate::error::Error;
use crate::loader::{SOURCE_LOCAL, SOURCE_NETWORK};
use crate::logbook::LogOp;
use crate::methods::substitute_me_ref;
use crate::refs::{Ref, VersionInfo};
use crate::scope::Scope;

pub fn register(d: &mut Dispatcher) {
    d.register_cursor("log.history", AttributeSet::post("/history/{ref...}"), history);
    d.register("log.log", AttributeSet::unrouted(), log);
    d.register("log.rawlogbook", AttributeSet::local_only(), raw_logbook);
    d.register("log.logbooksummary", AttributeSet::local_only(), logbook_summary);
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HistoryParams {
    #[serde(rename = "ref")]
    pub reference: String,
    pub limit: i64,
    pub offset: i64,
    /// Fetch history from the network before listing.
    pub pull: bool,
    pub source: String,
}

impl MethodParams for HistoryParams {
    fn set_nonzero_defaults(&mut self) {
        if self.limit == 0 {
            self.limit = 25;
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.reference.is_empty() {
            return Err(Error::validation("ref is required"));
        }
        if self.limit < 0 || self.offset < 0 {
            return Err(Error::validation("invalid limit / offset settings"));
        }
        if self.pull && self.source == SOURCE_LOCAL {
            return Err(Error::validation("cannot pull with only local source"));
        }
        Ok(())
    }

    fn source(&self) -> Option<&str> {
        Some(&self.source)
    }

    fn set_source(&mut self, source: &str) {
        self.source = source.to_string();
    }

    fn substitute_me(&mut self, active_username: &str) {
        substitute_me_ref(&mut self.reference, active_username);
    }
}

/// Paginated version history, enriched with local presence and commit
/// messages for locally present versions.
pub async fn history(
    scope: Scope,
    params: HistoryParams,
) -> Result<(Vec<VersionInfo>, Option<Cursor>), Error> {
    let mut r = Ref::parse_relaxed(&params.reference)?;
    let alias = r.alias();

    if params.pull {
        let location = scope
            .loader()
            .resolve_ref(scope.ctx(), &mut r, SOURCE_NETWORK)
            .await?;
        let ops = scope.remote().pull_logs(scope.ctx(), &r, &location).await?;
        scope.logbook().merge_ops(ops)?;
    }

    let versions = match scope.logbook().versions_for(&alias) {
        Some(versions) => versions,
        None => match scope.repo().resolve_alias(&alias) {
            // Known to the ref index but absent from the logbook (for
            // example pulled without logs): a single-entry history.
            Some(info) => vec![info],
            None => return Err(Error::not_found(format!("reference not found: {alias}"))),
        },
    };

    let fsi_path = scope
        .dscache()
        .lookup(&alias)
        .map(|entry| entry.fsi_path)
        .unwrap_or_default();

    let page: Vec<VersionInfo> = versions
        .into_iter()
        .skip(params.offset as usize)
        .take(params.limit as usize)
        .map(|mut info| {
            let local = !info.path.is_empty() && scope.repo().has_path(&info.path);
            info.foreign = !local;
            if local {
                if let Ok(ds) = scope.repo().get_dataset(&info.path) {
                    if let Some(commit) = ds.commit {
                        info.commit_title = commit.title;
                        info.commit_message = commit.message;
                    }
                    if let Some(structure) = ds.structure {
                        info.body_size = structure.length;
                        info.body_rows = structure.entries;
                    }
                }
            }
            info.fsi_path = fsi_path.clone();
            info
        })
        .collect();

    let next = HistoryParams {
        offset: params.offset + params.limit,
        pull: false,
        ..params.clone()
    };
    let cursor = scope.make_cursor(Some(&next), page.len(), params.limit as usize);
    Ok((page, cursor))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogParams {
    #[serde(rename = "ref")]
    pub reference: String,
    pub limit: i64,
    pub offset: i64,
}

impl MethodParams for LogParams {
    fn set_nonzero_defaults(&mut self) {
        if self.limit == 0 {
            self.limit = 25;
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.reference.is_empty() {
            return Err(Error::validation("ref is required"));
        }
        Ok(())
    }

    fn substitute_me(&mut self, active_username: &str) {
        substitute_me_ref(&mut self.reference, active_username);
    }
}

/// Raw ops for one ref, paginated.
pub async fn log(scope: Scope, params: LogParams) -> Result<Vec<LogOp>, Error> {
    let r = Ref::parse_relaxed(&params.reference)?;
    let alias = r.alias();
    let ops: Vec<LogOp> = scope
        .logbook()
        .raw()
        .into_iter()
        .filter(|op| op.alias() == alias)
        .skip(params.offset as usize)
        .take(params.limit as usize)
        .collect();
    if ops.is_empty() && !scope.logbook().has_ref(&alias) {
        return Err(Error::not_found(format!("reference not found: {alias}")));
    }
    Ok(ops)
}

/// Every op in the logbook. Local transport only.
pub async fn raw_logbook(scope: Scope, _params: EmptyParams) -> Result<Vec<LogOp>, Error> {
    Ok(scope.logbook().raw())
}

/// Per-ref logbook summary. Local transport only.
pub async fn logbook_summary(scope: Scope, _params: EmptyParams) -> Result<Value, Error> {
    Ok(scope.logbook().summary())
}
