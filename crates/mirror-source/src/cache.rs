//! The query table: identity-based lookup, derivation, expiration, eviction.

use chrono::{DateTime, Utc};
use serde_json::Value;

use mirror_core::url::{folder_url, match_url, object_url, omit_query};

use crate::query::{Query, QueryKey, QueryOptions, QueryType};

/// Owning container for every cached query of one data source instance.
pub(crate) struct CacheState {
    pub queries: Vec<Query>,
    next_id: u64,
}

impl CacheState {
    pub fn new() -> Self {
        Self {
            queries: Vec::new(),
            next_id: 1,
        }
    }

    /// First entry matching the key structurally.
    pub fn index_of_key(&self, key: &QueryKey) -> Option<usize> {
        self.queries.iter().position(|query| query.key == *key)
    }

    pub fn get(&self, id: u64) -> Option<&Query> {
        self.queries.iter().find(|query| query.id == id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Query> {
        self.queries.iter_mut().find(|query| query.id == id)
    }

    /// New queries go to the head of the table so the freshest entries are
    /// found first.
    pub fn insert_front(&mut self, mut query: Query) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        query.id = id;
        self.queries.insert(0, query);
        id
    }

    pub fn remove(&mut self, id: u64) {
        self.queries.retain(|query| query.id != id);
    }

    /// The object query caching a URL, regardless of options.
    pub fn find_object_by_url(&self, abs_url: &str) -> Option<&Query> {
        self.queries
            .iter()
            .find(|query| query.key.query_type == QueryType::Object && query.key.url == abs_url)
    }

    /// Locate a list/page entry whose results contain the object at a URL.
    ///
    /// Only non-expired, non-abbreviated collections qualify. Returns the
    /// matching object and the parent query's fetch time.
    pub fn derivable(&self, abs_url: &str) -> Option<(Value, Option<DateTime<Utc>>)> {
        let folder = folder_url(abs_url)?;
        for query in &self.queries {
            if query.key.query_type == QueryType::Object
                || query.expired
                || query.key.options.abbreviated
            {
                continue;
            }
            if omit_query(&query.key.url) != folder {
                continue;
            }
            let Some(items) = &query.items else { continue };
            for object in items {
                if object_url(&folder, object).as_deref() == Some(abs_url) {
                    return Some((object.clone(), query.time));
                }
            }
        }
        None
    }

    /// Synthesize an object query from a cached collection entry and splice
    /// it to the front of the table.
    pub fn derive_object(&mut self, abs_url: &str, options: &QueryOptions) -> Option<u64> {
        let (object, time) = self.derivable(abs_url)?;
        let mut query = Query::new(0, QueryKey::object(abs_url, options.clone()));
        query.object = Some(object);
        query.time = time;
        Some(self.insert_front(query))
    }

    /// Cached object value for a URL, via an object query or a derivable
    /// collection entry. Never touches the network.
    pub fn peek_object(&self, abs_url: &str) -> Option<Value> {
        if let Some(query) = self.find_object_by_url(abs_url) {
            if let Some(object) = &query.object {
                return Some(object.clone());
            }
        }
        self.derivable(abs_url).map(|(object, _)| object)
    }

    /// Whether a URL is served from cache, optionally requiring the entry to
    /// actually hold a result.
    pub fn is_cached(&self, abs_url: &str, require_results: bool) -> bool {
        if let Some(query) = self.queries.iter().find(|query| query.key.url == abs_url) {
            return !require_results || query.has_results();
        }
        self.derivable(abs_url).is_some()
    }

    /// Expire every query fetched at or before the cutoff (all of them when
    /// no cutoff is given). Returns whether anything flipped.
    pub fn invalidate(&mut self, cutoff: Option<DateTime<Utc>>) -> bool {
        let mut changed = false;
        for query in &mut self.queries {
            let Some(time) = query.time else { continue };
            let overdue = match cutoff {
                Some(cutoff) => time <= cutoff,
                None => true,
            };
            if overdue && !query.expired {
                query.expired = true;
                changed = true;
            }
        }
        changed
    }

    /// Expire every query whose URL falls under a prefix.
    pub fn invalidate_under(&mut self, prefix: &str) -> bool {
        let mut changed = false;
        for query in &mut self.queries {
            if !query.expired && query.has_results() && match_url(&query.key.url, prefix) {
                query.expired = true;
                changed = true;
            }
        }
        changed
    }

    /// Drop every query whose URL falls under one of the given prefixes.
    pub fn evict_under(&mut self, prefixes: &[String]) -> bool {
        let before = self.queries.len();
        self.queries.retain(|query| {
            !prefixes
                .iter()
                .any(|prefix| match_url(&query.key.url, prefix))
        });
        self.queries.len() != before
    }
}
