//! The cached-query model.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use mirror_core::{Completion, DataError, Minimum};

use crate::hooks::UpdateHook;

/// Shape of a cached read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryType {
    /// A single object.
    Object,
    /// One page of a collection.
    Page,
    /// A whole collection, possibly assembled from several pages.
    List,
}

/// Per-query options.
///
/// Options participate in query identity: two fetches with structurally equal
/// options share one cache entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    /// Fewest results the first resolution of a list/batch fetch may carry.
    pub minimum: Option<Minimum>,
    /// The result is abbreviated and must not be used to derive object
    /// queries.
    pub abbreviated: bool,
    /// Policy applied when an object is inserted into this query's folder.
    pub after_insert: Option<UpdateHook>,
    /// Policy applied when a matching object is updated.
    pub after_update: Option<UpdateHook>,
    /// Policy applied when a matching object is deleted.
    pub after_delete: Option<UpdateHook>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_minimum(mut self, minimum: impl Into<Minimum>) -> Self {
        self.minimum = Some(minimum.into());
        self
    }

    pub fn abbreviated(mut self) -> Self {
        self.abbreviated = true;
        self
    }

    pub fn with_after_insert(mut self, hook: UpdateHook) -> Self {
        self.after_insert = Some(hook);
        self
    }

    pub fn with_after_update(mut self, hook: UpdateHook) -> Self {
        self.after_update = Some(hook);
        self
    }

    pub fn with_after_delete(mut self, hook: UpdateHook) -> Self {
        self.after_delete = Some(hook);
        self
    }

    /// Reject hook configurations that make no sense for the query shape.
    pub(crate) fn validate(&self, query_type: QueryType) -> Result<(), DataError> {
        if query_type != QueryType::Object {
            return Ok(());
        }
        for hook in [&self.after_insert, &self.after_update, &self.after_delete]
            .into_iter()
            .flatten()
        {
            if !hook.valid_for_object() {
                return Err(DataError::InvalidOption(format!(
                    "{:?} hook is not valid on an object query",
                    hook
                )));
            }
        }
        Ok(())
    }
}

/// Identity of a cached query: shape, canonical URL, page, options.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryKey {
    pub query_type: QueryType,
    pub url: String,
    pub page: Option<u32>,
    pub options: QueryOptions,
}

impl QueryKey {
    pub fn object(url: impl Into<String>, options: QueryOptions) -> Self {
        Self {
            query_type: QueryType::Object,
            url: url.into(),
            page: None,
            options,
        }
    }

    pub fn page(url: impl Into<String>, page: u32, options: QueryOptions) -> Self {
        Self {
            query_type: QueryType::Page,
            url: url.into(),
            page: Some(page),
            options,
        }
    }

    pub fn list(url: impl Into<String>, options: QueryOptions) -> Self {
        Self {
            query_type: QueryType::List,
            url: url.into(),
            page: None,
            options,
        }
    }
}

/// The result of a list-shaped fetch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectList {
    pub items: Vec<Value>,
    /// Server-reported count across all pages.
    pub total: u64,
    /// Whether every page has been fetched; `fetch_more` on a complete list
    /// resolves immediately without network traffic.
    pub complete: bool,
}

/// Outcome signal shared by coalesced callers of one in-flight fetch.
pub(crate) type FetchSignal = Completion<Result<(), DataError>>;

/// A cached query.
pub(crate) struct Query {
    pub id: u64,
    pub key: QueryKey,
    /// Result slot for object queries.
    pub object: Option<Value>,
    /// Result slot for page/list queries.
    pub items: Option<Vec<Value>>,
    pub total: u64,
    pub complete: bool,
    /// Where the next page append will fetch from.
    pub next_url: Option<String>,
    /// Pages fetched so far.
    pub next_page: u32,
    /// Wall-clock time of the latest successful fetch.
    pub time: Option<DateTime<Utc>>,
    pub expired: bool,
    pub refreshing: bool,
    /// In-flight initial fetch; concurrent callers await this.
    pub pending: Option<FetchSignal>,
    /// In-flight page append; concurrent `fetch_more` calls coalesce on it.
    pub appending: Option<FetchSignal>,
    /// Present while a list refresh runs; `fetch_more` parks on it.
    pub refresh_done: Option<Completion<()>>,
}

impl Query {
    pub fn new(id: u64, key: QueryKey) -> Self {
        Self {
            id,
            key,
            object: None,
            items: None,
            total: 0,
            complete: false,
            next_url: None,
            next_page: 0,
            time: None,
            expired: false,
            refreshing: false,
            pending: None,
            appending: None,
            refresh_done: None,
        }
    }

    /// Whether the result slot has been populated.
    pub fn has_results(&self) -> bool {
        match self.key.query_type {
            QueryType::Object => self.object.is_some(),
            QueryType::Page | QueryType::List => self.items.is_some(),
        }
    }

    /// Snapshot the list-shaped result.
    pub fn object_list(&self) -> ObjectList {
        ObjectList {
            items: self.items.clone().unwrap_or_default(),
            total: self.total,
            complete: self.complete,
        }
    }

    /// Whether a read should kick off a background refresh.
    pub fn needs_refresh(&self) -> bool {
        self.expired && !self.refreshing
    }
}
