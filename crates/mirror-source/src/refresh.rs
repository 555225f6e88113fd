//! Background refresh protocols.
//!
//! Refreshes never reject a public promise: failures are logged and the
//! query stays expired. `refreshing` suppresses concurrent refreshes of the
//! same query.

use chrono::Utc;
use serde_json::Value;

use mirror_core::object::{append_objects, join_object_lists, replace_identical_objects};
use mirror_core::url::attach_page_number;
use mirror_core::{DataError, Deferred};

use crate::fetch::{parse_collection, CollectionResponse};
use crate::query::{QueryOptions, QueryType};
use crate::{DataSource, PAGE_REFETCH_DELAY};

impl DataSource {
    /// Kick off a background refresh for a query.
    pub(crate) fn spawn_refresh(&self, id: u64) {
        let source = self.clone();
        tokio::spawn(async move {
            source.refresh_query(id).await;
        });
    }

    pub(crate) async fn refresh_query(&self, id: u64) {
        let kind = {
            let mut state = self.inner.state.lock();
            let Some(query) = state.get_mut(id) else { return };
            if query.refreshing || query.pending.is_some() {
                return;
            }
            query.refreshing = true;
            query.key.query_type
        };
        let outcome = match kind {
            QueryType::Object => self.refresh_object(id).await,
            QueryType::Page => self.refresh_page(id).await,
            QueryType::List => self.refresh_list(id).await,
        };
        if let Err(error) = outcome {
            tracing::warn!(%error, "background refresh failed");
        }
    }

    /// Re-GET an object URL; replace and notify when it differs.
    async fn refresh_object(&self, id: u64) -> Result<(), DataError> {
        let Some(url) = self.query_url(id) else { return Ok(()) };
        let result = self.inner.adapter.get(&url).await;
        let changed = {
            let mut state = self.inner.state.lock();
            let Some(query) = state.get_mut(id) else { return Ok(()) };
            query.refreshing = false;
            let value = result?;
            let changed = query.object.as_ref() != Some(&value);
            if changed {
                query.object = Some(value);
            }
            query.time = Some(Utc::now());
            query.expired = false;
            changed
        };
        if changed {
            self.notify_change().await;
        }
        Ok(())
    }

    /// Re-GET a page. Unchanged entries keep their cached values; expired
    /// sibling pages of the same collection are evicted and re-fetched a
    /// moment later so pagination stays warm without thundering.
    async fn refresh_page(&self, id: u64) -> Result<(), DataError> {
        let target = {
            let state = self.inner.state.lock();
            state
                .get(id)
                .map(|query| (query.key.url.clone(), query.key.page.unwrap_or(1)))
        };
        let Some((url, page)) = target else { return Ok(()) };
        let result = self.inner.adapter.get(&attach_page_number(&url, page)).await;

        let (changed, evicted) = {
            let mut state = self.inner.state.lock();
            let Some(query) = state.get_mut(id) else { return Ok(()) };
            query.refreshing = false;
            let (items, total) = match result.and_then(parse_collection)? {
                CollectionResponse::Whole(items) => {
                    let total = items.len() as u64;
                    (items, total)
                }
                CollectionResponse::Page { items, total, .. } => (items, total),
            };
            let cached = query.items.as_deref().unwrap_or(&[]);
            let changed = replace_identical_objects(&items, cached).is_some();
            if changed {
                query.items = Some(items);
            }
            query.total = total;
            query.time = Some(Utc::now());
            query.expired = false;

            let evicted: Vec<(u64, String, u32, QueryOptions)> = state
                .queries
                .iter()
                .filter(|sibling| {
                    sibling.id != id
                        && sibling.key.query_type == QueryType::Page
                        && sibling.key.url == url
                        && sibling.expired
                        && !sibling.refreshing
                })
                .map(|sibling| {
                    (
                        sibling.id,
                        sibling.key.url.clone(),
                        sibling.key.page.unwrap_or(1),
                        sibling.key.options.clone(),
                    )
                })
                .collect();
            for (sibling_id, ..) in &evicted {
                state.remove(*sibling_id);
            }
            (changed, evicted)
        };

        for (_, sibling_url, sibling_page, options) in evicted {
            let source = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(PAGE_REFETCH_DELAY).await;
                if let Err(error) = source
                    .fetch_page(&sibling_url, sibling_page, options)
                    .await
                {
                    tracing::debug!(%error, "sibling page re-fetch failed");
                }
            });
        }
        if changed {
            self.notify_change().await;
        }
        Ok(())
    }

    /// Refresh a list query.
    ///
    /// Paginated lists wait for any in-flight append, park `fetch_more`
    /// callers, re-walk the known pages from the beginning and stitch the
    /// result onto the cached tail. Unpaginated lists are a single GET.
    async fn refresh_list(&self, id: u64) -> Result<(), DataError> {
        let mut done = Deferred::new();
        let (base_url, paginated, appending) = {
            let mut state = self.inner.state.lock();
            let Some(query) = state.get_mut(id) else { return Ok(()) };
            query.refresh_done = Some(done.completion());
            (
                query.key.url.clone(),
                query.next_page > 0,
                query.appending.clone(),
            )
        };

        // Let an in-flight append settle before re-walking.
        if let Some(signal) = appending {
            let _ = signal.wait().await;
        }

        let outcome = if paginated {
            self.rewalk_list(id, &base_url).await
        } else {
            self.reload_list(id, &base_url).await
        };

        {
            let mut state = self.inner.state.lock();
            if let Some(query) = state.get_mut(id) {
                query.refreshing = false;
                query.refresh_done = None;
            }
        }
        done.resolve(());

        match outcome {
            Ok(changed) => {
                if changed {
                    self.notify_change().await;
                }
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    /// Walk pages from the beginning, following `next`, until the server
    /// stops producing a new page or the walk reaches the previously-known
    /// depth. The cached tail beyond the walked prefix is preserved.
    async fn rewalk_list(&self, id: u64, base_url: &str) -> Result<bool, DataError> {
        let prior = {
            let state = self.inner.state.lock();
            state
                .get(id)
                .map(|query| (query.items.clone().unwrap_or_default(), query.next_page))
        };
        let Some((prior_items, prior_pages)) = prior else { return Ok(false) };

        let mut walked: Vec<Value> = Vec::new();
        let mut total = prior_items.len() as u64;
        let mut pages = 0u32;
        let mut next_url: Option<String> = None;
        let mut url = base_url.to_string();
        let mut whole = false;

        loop {
            let value = self.inner.adapter.get(&url).await?;
            match parse_collection(value)? {
                CollectionResponse::Whole(items) => {
                    total = items.len() as u64;
                    walked = items;
                    next_url = None;
                    whole = true;
                    break;
                }
                CollectionResponse::Page {
                    items,
                    total: count,
                    next,
                } => {
                    walked = append_objects(Some(&walked), &items);
                    pages += 1;
                    total = count;
                    next_url = next.clone();
                    match next {
                        Some(next) if pages < prior_pages => url = next,
                        _ => break,
                    }
                }
            }
        }

        let changed = {
            let mut state = self.inner.state.lock();
            let Some(query) = state.get_mut(id) else { return Ok(false) };
            let joined = if whole {
                walked
            } else {
                join_object_lists(&walked, &prior_items)
            };
            let cached = query.items.as_deref().unwrap_or(&[]);
            let changed = replace_identical_objects(&joined, cached).is_some();
            if changed {
                query.items = Some(joined);
            }
            query.total = total;
            query.complete = next_url.is_none();
            query.next_url = next_url;
            if pages > 0 {
                query.next_page = pages;
            }
            query.time = Some(Utc::now());
            query.expired = false;
            changed
        };
        Ok(changed)
    }

    /// Single-GET refresh for a list the server returns as a bare array.
    async fn reload_list(&self, id: u64, base_url: &str) -> Result<bool, DataError> {
        let value = self.inner.adapter.get(base_url).await?;
        let parsed = parse_collection(value)?;
        let changed = {
            let mut state = self.inner.state.lock();
            let Some(query) = state.get_mut(id) else { return Ok(false) };
            let (items, total, next) = match parsed {
                CollectionResponse::Whole(items) => {
                    let total = items.len() as u64;
                    (items, total, None)
                }
                CollectionResponse::Page { items, total, next } => (items, total, next),
            };
            let cached = query.items.as_deref().unwrap_or(&[]);
            let changed = replace_identical_objects(&items, cached).is_some();
            if changed {
                query.items = Some(items);
            }
            query.total = total;
            query.complete = next.is_none();
            query.next_url = next;
            query.time = Some(Utc::now());
            query.expired = false;
            changed
        };
        Ok(changed)
    }

    fn query_url(&self, id: u64) -> Option<String> {
        let state = self.inner.state.lock();
        state.get(id).map(|query| query.key.url.clone())
    }
}
