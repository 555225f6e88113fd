//! Read pipeline: `fetch_one`, `fetch_page`, `fetch_list`, `fetch_more`,
//! `fetch_multiple`.
//!
//! Every path goes cache-first; a miss inserts a placeholder query carrying a
//! completion signal so concurrent callers coalesce onto one network fetch.
//! An expired hit still resolves immediately with the stale value while a
//! background refresh runs.

use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;

use mirror_core::object::append_objects;
use mirror_core::url::attach_page_number;
use mirror_core::{resolve_minimum, Completion, DataError, Deferred};

use crate::query::{FetchSignal, ObjectList, Query, QueryKey, QueryOptions, QueryType};
use crate::DataSource;

/// A collection endpoint's answer: either the whole list as a bare array, or
/// one page of `{count, results, next}`.
pub(crate) enum CollectionResponse {
    Whole(Vec<Value>),
    Page {
        items: Vec<Value>,
        total: u64,
        next: Option<String>,
    },
}

pub(crate) fn parse_collection(value: Value) -> Result<CollectionResponse, DataError> {
    match value {
        Value::Array(items) => Ok(CollectionResponse::Whole(items)),
        Value::Object(map) => {
            let items = map
                .get("results")
                .and_then(Value::as_array)
                .cloned()
                .ok_or_else(|| {
                    DataError::Decode("collection response without a results array".to_string())
                })?;
            let total = map
                .get("count")
                .and_then(Value::as_u64)
                .unwrap_or(items.len() as u64);
            let next = map
                .get("next")
                .and_then(Value::as_str)
                .map(|url| url.to_string());
            Ok(CollectionResponse::Page { items, total, next })
        }
        other => Err(DataError::Decode(format!(
            "collection response is neither an array nor a page object: {}",
            other
        ))),
    }
}

enum ReadPlan<T> {
    Hit {
        value: T,
        needs_refresh: bool,
        id: u64,
    },
    Wait(FetchSignal),
    Fetch {
        id: u64,
        deferred: Deferred<Result<(), DataError>>,
    },
}

impl DataSource {
    /// Fetch a single object, serving it from cache when possible.
    ///
    /// A cache miss first attempts to derive the object from a cached
    /// collection; only then does it hit the network. An expired hit
    /// resolves with the stale value and refreshes in the background.
    pub async fn fetch_one(&self, url: &str, options: QueryOptions) -> Result<Value, DataError> {
        options.validate(QueryType::Object)?;
        let abs = self.resolve_url(url);
        let key = QueryKey::object(abs.clone(), options);

        loop {
            let plan = {
                let mut state = self.inner.state.lock();
                if let Some(index) = state.index_of_key(&key) {
                    let query = &state.queries[index];
                    if let Some(object) = &query.object {
                        ReadPlan::Hit {
                            value: object.clone(),
                            needs_refresh: query.needs_refresh(),
                            id: query.id,
                        }
                    } else if let Some(signal) = &query.pending {
                        ReadPlan::Wait(signal.clone())
                    } else {
                        // A shell left behind by an aborted fetch; take it over.
                        let deferred = Deferred::new();
                        let id = query.id;
                        if let Some(query) = state.get_mut(id) {
                            query.pending = Some(deferred.completion());
                        }
                        ReadPlan::Fetch { id, deferred }
                    }
                } else if let Some(id) = state.derive_object(&abs, &key.options) {
                    match state.get(id) {
                        Some(query) => ReadPlan::Hit {
                            value: query.object.clone().unwrap_or(Value::Null),
                            needs_refresh: query.needs_refresh(),
                            id,
                        },
                        None => continue,
                    }
                } else {
                    let deferred = Deferred::new();
                    let mut query = Query::new(0, key.clone());
                    query.pending = Some(deferred.completion());
                    let id = state.insert_front(query);
                    ReadPlan::Fetch { id, deferred }
                }
            };

            match plan {
                ReadPlan::Hit {
                    value,
                    needs_refresh,
                    id,
                } => {
                    if needs_refresh {
                        self.spawn_refresh(id);
                    }
                    return Ok(value);
                }
                ReadPlan::Wait(signal) => match signal.wait().await {
                    Some(Err(error)) => return Err(error),
                    _ => continue,
                },
                ReadPlan::Fetch { id, mut deferred } => {
                    tracing::debug!(url = %abs, "fetching object");
                    let result = self.inner.adapter.get(&abs).await;
                    let outcome = {
                        let mut state = self.inner.state.lock();
                        match result {
                            Ok(value) => {
                                if let Some(query) = state.get_mut(id) {
                                    query.object = Some(value.clone());
                                    query.time = Some(Utc::now());
                                    query.expired = false;
                                    query.pending = None;
                                }
                                Ok(value)
                            }
                            Err(error) => {
                                state.remove(id);
                                Err(error)
                            }
                        }
                    };
                    deferred.resolve(outcome.clone().map(|_| ()));
                    return outcome;
                }
            }
        }
    }

    /// Fetch one page of a collection.
    ///
    /// The page number becomes part of the query identity; the URL actually
    /// fetched carries a `page` parameter (except for page 1).
    pub async fn fetch_page(
        &self,
        url: &str,
        page: u32,
        options: QueryOptions,
    ) -> Result<ObjectList, DataError> {
        options.validate(QueryType::Page)?;
        let abs = self.resolve_url(url);
        let options = self.normalize_collection_options(options);
        let key = QueryKey::page(abs.clone(), page, options);

        loop {
            let plan = self.collection_plan(&key);
            match plan {
                ReadPlan::Hit {
                    value,
                    needs_refresh,
                    id,
                } => {
                    if needs_refresh {
                        self.spawn_refresh(id);
                    }
                    return Ok(value);
                }
                ReadPlan::Wait(signal) => match signal.wait().await {
                    Some(Err(error)) => return Err(error),
                    _ => continue,
                },
                ReadPlan::Fetch { id, mut deferred } => {
                    let fetch_url = attach_page_number(&abs, page);
                    tracing::debug!(url = %fetch_url, "fetching page");
                    let outcome = self.populate_page(id, &fetch_url).await;
                    deferred.resolve(outcome.clone().map(|_| ()));
                    match outcome {
                        Ok(list) => return Ok(list),
                        Err(error) => return Err(error),
                    }
                }
            }
        }
    }

    /// Fetch a complete list, walking pages until the configured `minimum`
    /// is satisfied. The result's `complete` flag reports whether further
    /// pages remain for [`fetch_more`](Self::fetch_more).
    pub async fn fetch_list(&self, url: &str, options: QueryOptions) -> Result<ObjectList, DataError> {
        options.validate(QueryType::List)?;
        let abs = self.resolve_url(url);
        let options = self.normalize_collection_options(options);
        let key = QueryKey::list(abs.clone(), options);

        loop {
            let plan = self.collection_plan(&key);
            match plan {
                ReadPlan::Hit {
                    value,
                    needs_refresh,
                    id,
                } => {
                    if needs_refresh {
                        self.spawn_refresh(id);
                    }
                    return Ok(value);
                }
                ReadPlan::Wait(signal) => match signal.wait().await {
                    Some(Err(error)) => return Err(error),
                    _ => continue,
                },
                ReadPlan::Fetch { id, mut deferred } => {
                    tracing::debug!(url = %abs, "fetching list");
                    let outcome = self.populate_list(id, &abs).await;
                    deferred.resolve(outcome.clone().map(|_| ()));
                    match outcome {
                        Ok(list) => return Ok(list),
                        Err(error) => return Err(error),
                    }
                }
            }
        }
    }

    /// Append the next page to a cached list.
    ///
    /// Resolves immediately when the list is complete. Concurrent calls
    /// coalesce onto one request; calls arriving during a list refresh park
    /// until the refresh finishes, then fetch live.
    pub async fn fetch_more(&self, url: &str, options: QueryOptions) -> Result<ObjectList, DataError> {
        options.validate(QueryType::List)?;
        let abs = self.resolve_url(url);
        let options = self.normalize_collection_options(options);
        let key = QueryKey::list(abs.clone(), options.clone());

        loop {
            enum MorePlan {
                Missing,
                Done(ObjectList),
                Parked(Completion<()>),
                Coalesce(FetchSignal),
                Fetch {
                    id: u64,
                    fetch_url: String,
                    deferred: Deferred<Result<(), DataError>>,
                },
            }

            let plan = {
                let mut state = self.inner.state.lock();
                match state.index_of_key(&key) {
                    None => MorePlan::Missing,
                    Some(index) => {
                        let query = &state.queries[index];
                        if query.items.is_none() {
                            match &query.pending {
                                Some(signal) => MorePlan::Coalesce(signal.clone()),
                                None => MorePlan::Missing,
                            }
                        } else if let Some(done) = &query.refresh_done {
                            MorePlan::Parked(done.clone())
                        } else if query.complete {
                            MorePlan::Done(query.object_list())
                        } else if let Some(signal) = &query.appending {
                            MorePlan::Coalesce(signal.clone())
                        } else {
                            let deferred = Deferred::new();
                            let id = query.id;
                            let fetch_url =
                                query.next_url.clone().unwrap_or_else(|| abs.clone());
                            if let Some(query) = state.get_mut(id) {
                                query.appending = Some(deferred.completion());
                            }
                            MorePlan::Fetch {
                                id,
                                fetch_url,
                                deferred,
                            }
                        }
                    }
                }
            };

            match plan {
                MorePlan::Missing => return self.fetch_list(url, options).await,
                MorePlan::Done(list) => return Ok(list),
                MorePlan::Parked(done) => {
                    done.wait().await;
                    continue;
                }
                MorePlan::Coalesce(signal) => {
                    // Coalesced callers share the in-flight append's result
                    // rather than starting an append of their own.
                    match signal.wait().await {
                        Some(Err(error)) => return Err(error),
                        _ => {
                            let snapshot = {
                                let state = self.inner.state.lock();
                                state
                                    .index_of_key(&key)
                                    .map(|index| state.queries[index].object_list())
                            };
                            match snapshot {
                                Some(list) => return Ok(list),
                                None => continue,
                            }
                        }
                    }
                }
                MorePlan::Fetch {
                    id,
                    fetch_url,
                    mut deferred,
                } => {
                    tracing::debug!(url = %fetch_url, "fetching next page");
                    let result = self.inner.adapter.get(&fetch_url).await;
                    let outcome = {
                        let mut state = self.inner.state.lock();
                        let applied = match result.and_then(parse_collection) {
                            Ok(parsed) => {
                                if let Some(query) = state.get_mut(id) {
                                    apply_collection_response(query, parsed);
                                    query.appending = None;
                                    query.time = Some(Utc::now());
                                    Ok(query.object_list())
                                } else {
                                    Err(DataError::Decode(
                                        "query evicted during page append".to_string(),
                                    ))
                                }
                            }
                            Err(error) => {
                                if let Some(query) = state.get_mut(id) {
                                    query.appending = None;
                                }
                                Err(error)
                            }
                        };
                        applied
                    };
                    deferred.resolve(outcome.clone().map(|_| ()));
                    let list = outcome?;
                    self.notify_change().await;
                    return Ok(list);
                }
            }
        }
    }

    /// Fetch a batch of objects.
    ///
    /// When enough of the batch is already cached to satisfy `minimum`, the
    /// call resolves immediately with `None` holes for the missing entries
    /// and completes the rest in the background, firing `change` once the
    /// full set has arrived.
    pub async fn fetch_multiple(
        &self,
        urls: &[String],
        options: QueryOptions,
    ) -> Result<Vec<Option<Value>>, DataError> {
        let abs_urls: Vec<String> = urls.iter().map(|url| self.resolve_url(url)).collect();
        let cached: Vec<Option<Value>> = {
            let state = self.inner.state.lock();
            abs_urls.iter().map(|url| state.peek_object(url)).collect()
        };
        let available = cached.iter().filter(|value| value.is_some()).count();
        let minimum = resolve_minimum(options.minimum.as_ref(), abs_urls.len(), abs_urls.len());
        let item_options = QueryOptions {
            minimum: None,
            ..options
        };

        if available >= minimum {
            if available < abs_urls.len() {
                let missing: Vec<String> = abs_urls
                    .iter()
                    .zip(&cached)
                    .filter(|(_, value)| value.is_none())
                    .map(|(url, _)| url.clone())
                    .collect();
                let source = self.clone();
                tokio::spawn(async move {
                    let fetches = missing
                        .iter()
                        .map(|url| source.fetch_one(url, item_options.clone()));
                    for (url, result) in missing.iter().zip(join_all(fetches).await) {
                        if let Err(error) = result {
                            tracing::warn!(url = %url, %error, "background batch fetch failed");
                        }
                    }
                    source.notify_change().await;
                });
            }
            return Ok(cached);
        }

        let fetches = abs_urls
            .iter()
            .map(|url| self.fetch_one(url, item_options.clone()));
        let settled = join_all(fetches).await;
        let mut results = Vec::with_capacity(settled.len());
        let mut errors = Vec::with_capacity(settled.len());
        let mut first: Option<DataError> = None;
        for outcome in settled {
            match outcome {
                Ok(value) => {
                    results.push(Some(value));
                    errors.push(None);
                }
                Err(error) => {
                    if first.is_none() {
                        first = Some(error.clone());
                    }
                    results.push(None);
                    errors.push(Some(error));
                }
            }
        }
        match first {
            Some(first) => Err(DataError::Batch {
                results,
                errors,
                first: Box::new(first),
            }),
            None => Ok(results),
        }
    }

    // --- shared plumbing --------------------------------------------------

    /// Collections created while `abbreviated_folder_contents` is set are
    /// abbreviated by default; the flag participates in query identity, so
    /// it is folded in before any lookup.
    fn normalize_collection_options(&self, mut options: QueryOptions) -> QueryOptions {
        options.abbreviated |= self.inner.config.abbreviated_folder_contents;
        options
    }

    fn collection_plan(&self, key: &QueryKey) -> ReadPlan<ObjectList> {
        let mut state = self.inner.state.lock();
        if let Some(index) = state.index_of_key(key) {
            let query = &state.queries[index];
            if query.items.is_some() {
                ReadPlan::Hit {
                    value: query.object_list(),
                    needs_refresh: query.needs_refresh(),
                    id: query.id,
                }
            } else if let Some(signal) = &query.pending {
                ReadPlan::Wait(signal.clone())
            } else {
                let deferred = Deferred::new();
                let id = query.id;
                if let Some(query) = state.get_mut(id) {
                    query.pending = Some(deferred.completion());
                }
                ReadPlan::Fetch { id, deferred }
            }
        } else {
            let deferred = Deferred::new();
            let mut query = Query::new(0, key.clone());
            query.pending = Some(deferred.completion());
            let id = state.insert_front(query);
            ReadPlan::Fetch { id, deferred }
        }
    }

    async fn populate_page(&self, id: u64, fetch_url: &str) -> Result<ObjectList, DataError> {
        let result = self.inner.adapter.get(fetch_url).await;
        let parsed = match result.and_then(parse_collection) {
            Ok(parsed) => parsed,
            Err(error) => {
                self.abandon_fetch(id);
                return Err(error);
            }
        };
        let mut state = self.inner.state.lock();
        let Some(query) = state.get_mut(id) else {
            return Err(DataError::Decode("query evicted during fetch".to_string()));
        };
        match parsed {
            CollectionResponse::Whole(items) => {
                query.total = items.len() as u64;
                query.items = Some(items);
            }
            CollectionResponse::Page { items, total, .. } => {
                query.total = total;
                query.items = Some(items);
            }
        }
        query.complete = true;
        query.pending = None;
        query.time = Some(Utc::now());
        query.expired = false;
        Ok(query.object_list())
    }

    /// Walk pages from the current position until the minimum is satisfied
    /// or the collection ends.
    async fn populate_list(&self, id: u64, base_url: &str) -> Result<ObjectList, DataError> {
        loop {
            let fetch_url = {
                let state = self.inner.state.lock();
                match state.get(id) {
                    Some(query) => query
                        .next_url
                        .clone()
                        .unwrap_or_else(|| base_url.to_string()),
                    None => {
                        return Err(DataError::Decode("query evicted during fetch".to_string()))
                    }
                }
            };
            let result = self.inner.adapter.get(&fetch_url).await;
            let parsed = match result.and_then(parse_collection) {
                Ok(parsed) => parsed,
                Err(error) => {
                    self.abandon_fetch(id);
                    return Err(error);
                }
            };

            let mut state = self.inner.state.lock();
            let Some(query) = state.get_mut(id) else {
                return Err(DataError::Decode("query evicted during fetch".to_string()));
            };
            apply_collection_response(query, parsed);
            let length = query.items.as_ref().map_or(0, Vec::len);
            let minimum = resolve_minimum(
                query.key.options.minimum.as_ref(),
                query.total as usize,
                0,
            );
            if query.complete || length >= minimum {
                query.pending = None;
                query.time = Some(Utc::now());
                query.expired = false;
                return Ok(query.object_list());
            }
        }
    }

    /// Clean up a placeholder query after a failed initial fetch. A query
    /// that already holds data merely expires.
    fn abandon_fetch(&self, id: u64) {
        let mut state = self.inner.state.lock();
        let remove = match state.get_mut(id) {
            Some(query) => {
                query.pending = None;
                if query.has_results() {
                    query.expired = true;
                    false
                } else {
                    true
                }
            }
            None => false,
        };
        if remove {
            state.remove(id);
        }
    }
}

/// Fold one collection response into a list query.
pub(crate) fn apply_collection_response(query: &mut Query, parsed: CollectionResponse) {
    match parsed {
        CollectionResponse::Whole(items) => {
            query.total = items.len() as u64;
            query.items = Some(items);
            query.complete = true;
            query.next_url = None;
        }
        CollectionResponse::Page { items, total, next } => {
            let merged = append_objects(query.items.as_deref(), &items);
            query.items = Some(merged);
            query.total = total;
            query.next_page += 1;
            query.complete = next.is_none();
            query.next_url = next;
        }
    }
}
