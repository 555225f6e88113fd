//! Write operations and the propagation engine.
//!
//! Each batch write dispatches its objects in parallel, segregates the
//! outcomes by target folder and by success/rejection, then routes every
//! cached query through its configured hook so the whole cache stays
//! coherent with what the server accepted.

use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;

use mirror_core::object::{contains_object, find_object_index};
use mirror_core::url::{folder_url, object_folder_url, object_url, omit_query};
use mirror_core::DataError;

use crate::cache::CacheState;
use crate::hooks::{HookOutcome, UpdateHook};
use crate::query::{Query, QueryKey, QueryOptions, QueryType};
use crate::DataSource;

/// What kind of write produced an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    Insert,
    Update,
    Delete,
}

/// How a public write method maps objects onto requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Insert,
    Update,
    Delete,
    /// POST objects without an identity, PUT the rest.
    Save,
}

/// One folder's share of a write: confirmed results plus objects the server
/// rejected as out of sync (404, 409, 410).
struct MutationSet {
    folder_url: String,
    kind: WriteKind,
    results: Vec<Value>,
    rejects: Vec<Value>,
}

impl DataSource {
    /// POST one object into a folder, returning the server's representation.
    pub async fn insert_one(&self, folder: &str, object: Value) -> Result<Value, DataError> {
        self.write_one(folder, object, WriteMode::Insert).await
    }

    /// POST several objects into a folder in parallel.
    pub async fn insert_multiple(
        &self,
        folder: &str,
        objects: Vec<Value>,
    ) -> Result<Vec<Value>, DataError> {
        self.write_multiple(folder, objects, WriteMode::Insert).await
    }

    /// PUT one object.
    pub async fn update_one(&self, folder: &str, object: Value) -> Result<Value, DataError> {
        self.write_one(folder, object, WriteMode::Update).await
    }

    /// PUT several objects in parallel.
    pub async fn update_multiple(
        &self,
        folder: &str,
        objects: Vec<Value>,
    ) -> Result<Vec<Value>, DataError> {
        self.write_multiple(folder, objects, WriteMode::Update).await
    }

    /// DELETE one object.
    pub async fn delete_one(&self, folder: &str, object: Value) -> Result<Value, DataError> {
        self.write_one(folder, object, WriteMode::Delete).await
    }

    /// DELETE several objects in parallel.
    pub async fn delete_multiple(
        &self,
        folder: &str,
        objects: Vec<Value>,
    ) -> Result<Vec<Value>, DataError> {
        self.write_multiple(folder, objects, WriteMode::Delete).await
    }

    /// Upsert one object: POST when it has no identity, PUT otherwise.
    pub async fn save_one(&self, folder: &str, object: Value) -> Result<Value, DataError> {
        self.write_one(folder, object, WriteMode::Save).await
    }

    /// Upsert several objects in parallel.
    pub async fn save_multiple(
        &self,
        folder: &str,
        objects: Vec<Value>,
    ) -> Result<Vec<Value>, DataError> {
        self.write_multiple(folder, objects, WriteMode::Save).await
    }

    async fn write_one(
        &self,
        folder: &str,
        object: Value,
        mode: WriteMode,
    ) -> Result<Value, DataError> {
        let mut results = self.write_multiple(folder, vec![object], mode).await?;
        results
            .pop()
            .ok_or_else(|| DataError::Decode("empty batch result".to_string()))
    }

    async fn write_multiple(
        &self,
        folder: &str,
        objects: Vec<Value>,
        mode: WriteMode,
    ) -> Result<Vec<Value>, DataError> {
        let abs_folder = self.resolve_url(folder);
        let attempts = objects
            .iter()
            .map(|object| self.write_object(&abs_folder, object, mode));
        let settled = join_all(attempts).await;

        let mut sets: Vec<MutationSet> = Vec::new();
        let mut results: Vec<Option<Value>> = Vec::new();
        let mut errors: Vec<Option<DataError>> = Vec::new();
        for ((kind, outcome), input) in settled.into_iter().zip(&objects) {
            match outcome {
                Ok(value) => {
                    let target = object_folder_url(&abs_folder, &value);
                    push_into(&mut sets, &target, kind).results.push(value.clone());
                    results.push(Some(value));
                    errors.push(None);
                }
                Err(error) => {
                    if matches!(error.status(), Some(404 | 409 | 410)) {
                        let target = object_folder_url(&abs_folder, input);
                        push_into(&mut sets, &target, kind).rejects.push(input.clone());
                    }
                    results.push(None);
                    errors.push(Some(error));
                }
            }
        }

        let changed = {
            let mut state = self.inner.state.lock();
            let mut changed = false;
            for set in &sets {
                changed |= apply_mutation_set(&mut state, set);
            }
            changed
        };
        if changed {
            self.notify_change().await;
        }

        let first = errors.iter().flatten().next().cloned();
        match first {
            Some(first) => Err(DataError::Batch {
                results,
                errors,
                first: Box::new(first),
            }),
            None => Ok(results.into_iter().flatten().collect()),
        }
    }

    async fn write_object(
        &self,
        abs_folder: &str,
        object: &Value,
        mode: WriteMode,
    ) -> (WriteKind, Result<Value, DataError>) {
        let kind = match mode {
            WriteMode::Insert => WriteKind::Insert,
            WriteMode::Update => WriteKind::Update,
            WriteMode::Delete => WriteKind::Delete,
            WriteMode::Save => {
                if has_identity(object) {
                    WriteKind::Update
                } else {
                    WriteKind::Insert
                }
            }
        };
        let result = match kind {
            WriteKind::Insert => self
                .inner
                .adapter
                .post(abs_folder, object)
                .await
                .map(|body| body.unwrap_or_else(|| object.clone())),
            WriteKind::Update => match object_url(abs_folder, object) {
                Some(url) => self
                    .inner
                    .adapter
                    .put(&url, object)
                    .await
                    .map(|body| body.unwrap_or_else(|| object.clone())),
                None => Err(DataError::InvalidUrl(format!(
                    "object in {} has no identity",
                    abs_folder
                ))),
            },
            WriteKind::Delete => match object_url(abs_folder, object) {
                Some(url) => self
                    .inner
                    .adapter
                    .delete(&url)
                    .await
                    .map(|_| object.clone()),
                None => Err(DataError::InvalidUrl(format!(
                    "object in {} has no identity",
                    abs_folder
                ))),
            },
        };
        (kind, result)
    }
}

fn has_identity(object: &Value) -> bool {
    object.get("id").map_or(false, |id| !id.is_null())
        || object.get("url").map_or(false, |url| !url.is_null())
}

fn push_into<'a>(
    sets: &'a mut Vec<MutationSet>,
    folder_url: &str,
    kind: WriteKind,
) -> &'a mut MutationSet {
    let position = sets
        .iter()
        .position(|set| set.folder_url == folder_url && set.kind == kind);
    match position {
        Some(index) => &mut sets[index],
        None => {
            sets.push(MutationSet {
                folder_url: folder_url.to_string(),
                kind,
                results: Vec::new(),
                rejects: Vec::new(),
            });
            let last = sets.len() - 1;
            &mut sets[last]
        }
    }
}

/// Walk the whole query table and apply one folder's mutation outcomes.
fn apply_mutation_set(state: &mut CacheState, set: &MutationSet) -> bool {
    let mut changed = false;
    let mut removals: Vec<u64> = Vec::new();

    for query in &mut state.queries {
        let applied = match query.key.query_type {
            QueryType::Object => apply_to_object_query(query, set, &mut removals),
            QueryType::Page | QueryType::List => apply_to_collection_query(query, set),
        };
        changed |= applied;
    }
    for id in removals {
        state.remove(id);
        changed = true;
    }

    // Newly created objects become fresh object queries at the head of the
    // table; identity matching alone can never route an insert to them.
    if set.kind == WriteKind::Insert {
        for object in &set.results {
            let Some(url) = object_url(&set.folder_url, object) else { continue };
            if state.find_object_by_url(&url).is_some() {
                continue;
            }
            let mut query = Query::new(0, QueryKey::object(url, QueryOptions::default()));
            query.object = Some(object.clone());
            query.time = Some(Utc::now());
            state.insert_front(query);
            changed = true;
        }
    }
    changed
}

fn apply_to_object_query(query: &mut Query, set: &MutationSet, removals: &mut Vec<u64>) -> bool {
    let Some(folder) = folder_url(&query.key.url) else { return false };
    if folder != set.folder_url {
        return false;
    }
    let Some(cached) = query.object.clone() else { return false };

    let target_url = query.key.url.clone();
    let targets_query = move |object: &Value| {
        object_url(&set.folder_url, object).as_deref() == Some(target_url.as_str())
    };
    if set.rejects.iter().any(|object| targets_query(object)) {
        return expire(query);
    }
    let Some(incoming) = set.results.iter().find(|object| targets_query(object)) else {
        return false;
    };

    match set.kind {
        // Fresh object queries for inserts are handled at the table level.
        WriteKind::Insert => false,
        WriteKind::Update => {
            if cached == *incoming {
                return false;
            }
            let hook = query
                .key
                .options
                .after_update
                .clone()
                .unwrap_or(UpdateHook::Replace);
            let outcome = run_object_hook(&hook, &cached, incoming);
            apply_object_outcome(query, outcome)
        }
        WriteKind::Delete => {
            let hook = query
                .key
                .options
                .after_delete
                .clone()
                .unwrap_or(UpdateHook::Remove);
            if hook == UpdateHook::Remove {
                removals.push(query.id);
                return true;
            }
            let outcome = run_object_hook(&hook, &cached, incoming);
            apply_object_outcome(query, outcome)
        }
    }
}

fn apply_to_collection_query(query: &mut Query, set: &MutationSet) -> bool {
    if omit_query(&query.key.url) != set.folder_url {
        return false;
    }
    let Some(cached) = query.items.clone() else { return false };
    let mut changed = false;

    if set
        .rejects
        .iter()
        .any(|object| contains_object(&cached, object))
    {
        changed |= expire(query);
    }
    if set.results.is_empty() {
        return changed;
    }

    let (subset, hook) = match set.kind {
        WriteKind::Insert => {
            let fresh: Vec<Value> = set
                .results
                .iter()
                .filter(|object| !contains_object(&cached, object))
                .cloned()
                .collect();
            let hook = query
                .key
                .options
                .after_insert
                .clone()
                .unwrap_or(UpdateHook::Refresh);
            (fresh, hook)
        }
        WriteKind::Update => {
            let differing: Vec<Value> = set
                .results
                .iter()
                .filter(|object| match find_object_index(&cached, object) {
                    Some(index) => cached[index] != **object,
                    None => false,
                })
                .cloned()
                .collect();
            let hook = query
                .key
                .options
                .after_update
                .clone()
                .unwrap_or(UpdateHook::Refresh);
            (differing, hook)
        }
        WriteKind::Delete => {
            let matched: Vec<Value> = set
                .results
                .iter()
                .filter(|object| contains_object(&cached, object))
                .cloned()
                .collect();
            let default = match query.key.query_type {
                QueryType::List => UpdateHook::Remove,
                _ => UpdateHook::Refresh,
            };
            let hook = query.key.options.after_delete.clone().unwrap_or(default);
            (matched, hook)
        }
    };
    if subset.is_empty() {
        return changed;
    }

    let outcome = match hook.apply_to_list(&cached, &subset) {
        Ok(outcome) => outcome,
        Err(error) => {
            tracing::warn!(%error, url = %query.key.url, "update hook failed");
            HookOutcome::Expire
        }
    };
    match outcome {
        HookOutcome::Unchanged => {}
        HookOutcome::Expire => changed |= expire(query),
        HookOutcome::ReplaceList(items) => {
            // Recompute the reported total; pagination state is untouched.
            let delta = items.len() as i64 - cached.len() as i64;
            query.total = (query.total as i64 + delta).max(0) as u64;
            query.items = Some(items);
            changed = true;
        }
        HookOutcome::ReplaceObject(_) => {
            tracing::warn!(url = %query.key.url, "hook returned an object for a collection query");
            changed |= expire(query);
        }
    }
    changed
}

fn run_object_hook(hook: &UpdateHook, cached: &Value, incoming: &Value) -> HookOutcome {
    match hook.apply_to_object(cached, incoming) {
        Ok(outcome) => outcome,
        Err(error) => {
            tracing::warn!(%error, "update hook failed");
            HookOutcome::Expire
        }
    }
}

fn apply_object_outcome(query: &mut Query, outcome: HookOutcome) -> bool {
    match outcome {
        HookOutcome::Unchanged => false,
        HookOutcome::Expire => expire(query),
        HookOutcome::ReplaceObject(value) => {
            if query.object.as_ref() == Some(&value) {
                return false;
            }
            query.object = Some(value);
            true
        }
        HookOutcome::ReplaceList(_) => {
            tracing::warn!(url = %query.key.url, "hook returned a list for an object query");
            expire(query)
        }
    }
}

fn expire(query: &mut Query) -> bool {
    if query.expired {
        return false;
    }
    query.expired = true;
    true
}
