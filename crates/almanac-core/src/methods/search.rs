//! Registry search.

use serde::{Deserialize, Serialize};

use crate::cursor::Cursor;
use crate::dispatch::{AttributeSet, Dispatcher, MethodParams};
use crate::error::Error;
use crate::refs::VersionInfo;
use crate::scope::Scope;

pub fn register(d: &mut Dispatcher) {
    d.register_cursor("search.search", AttributeSet::get("/search"), search);
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    pub q: String,
    pub limit: i64,
    pub offset: i64,
}

impl MethodParams for SearchParams {
    fn set_nonzero_defaults(&mut self) {
        if self.limit == 0 {
            self.limit = 25;
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.q.is_empty() {
            return Err(Error::validation("search query is required"));
        }
        if self.limit < 0 || self.offset < 0 {
            return Err(Error::validation("invalid limit / offset settings"));
        }
        Ok(())
    }
}

pub async fn search(
    scope: Scope,
    params: SearchParams,
) -> Result<(Vec<VersionInfo>, Option<Cursor>), Error> {
    let hits = scope
        .registry()
        .search(
            scope.ctx(),
            &params.q,
            params.limit as usize,
            params.offset as usize,
        )
        .await
        .map_err(|e| e.context("search"))?;
    let next = SearchParams {
        offset: params.offset + params.limit,
        ..params.clone()
    };
    let cursor = scope.make_cursor(Some(&next), hits.len(), params.limit as usize);
    Ok((hits, cursor))
}
