//! Per-query update hooks.
//!
//! A hook decides how a write's results flow into one cached query. The named
//! variants cover the common policies; `Custom` lets the host compute the new
//! cached value itself.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use mirror_core::object::find_object_index;
use mirror_core::DataError;

/// Input handed to a custom hook.
#[derive(Debug, Clone, Copy)]
pub enum HookInput<'a> {
    /// An object query: the cached object and the written counterpart.
    Object { cached: &'a Value, incoming: &'a Value },
    /// A list or page query: the cached items and the relevant written subset.
    List { cached: &'a [Value], incoming: &'a [Value] },
}

/// What a hook decided.
#[derive(Debug, Clone, PartialEq)]
pub enum HookOutcome {
    /// Leave the cached value alone.
    Unchanged,
    /// Mark the query expired; it refreshes on the next read.
    Expire,
    /// Replace the cached object.
    ReplaceObject(Value),
    /// Replace the cached item list.
    ReplaceList(Vec<Value>),
}

/// Custom hook function.
pub type CustomHook = Arc<dyn Fn(HookInput<'_>) -> Result<HookOutcome, DataError> + Send + Sync>;

/// Policy mapping a write operation's results to a cache update.
#[derive(Clone)]
pub enum UpdateHook {
    /// Mark the query expired.
    Refresh,
    /// No change.
    Ignore,
    /// Replace the cached object / matching list entries in place.
    Replace,
    /// Prepend new entries. List queries only.
    Unshift,
    /// Append new entries. List queries only.
    Push,
    /// Drop the object query / filter out matching entries.
    Remove,
    /// Host-supplied policy.
    Custom(CustomHook),
}

impl fmt::Debug for UpdateHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Refresh => "Refresh",
            Self::Ignore => "Ignore",
            Self::Replace => "Replace",
            Self::Unshift => "Unshift",
            Self::Push => "Push",
            Self::Remove => "Remove",
            Self::Custom(_) => "Custom",
        };
        f.write_str(name)
    }
}

impl PartialEq for UpdateHook {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Refresh, Self::Refresh)
            | (Self::Ignore, Self::Ignore)
            | (Self::Replace, Self::Replace)
            | (Self::Unshift, Self::Unshift)
            | (Self::Push, Self::Push)
            | (Self::Remove, Self::Remove) => true,
            (Self::Custom(a), Self::Custom(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl UpdateHook {
    /// Whether this hook makes sense on an object query.
    pub fn valid_for_object(&self) -> bool {
        !matches!(self, Self::Unshift | Self::Push)
    }

    /// Run the hook against an object query.
    pub(crate) fn apply_to_object(
        &self,
        cached: &Value,
        incoming: &Value,
    ) -> Result<HookOutcome, DataError> {
        match self {
            Self::Refresh | Self::Remove => Ok(HookOutcome::Expire),
            Self::Ignore => Ok(HookOutcome::Unchanged),
            Self::Replace => {
                if cached == incoming {
                    Ok(HookOutcome::Unchanged)
                } else {
                    Ok(HookOutcome::ReplaceObject(incoming.clone()))
                }
            }
            Self::Unshift | Self::Push => Err(DataError::InvalidOption(
                format!("{:?} hook is not valid on an object query", self),
            )),
            Self::Custom(hook) => hook(HookInput::Object { cached, incoming }),
        }
    }

    /// Run the hook against a list or page query.
    pub(crate) fn apply_to_list(
        &self,
        cached: &[Value],
        incoming: &[Value],
    ) -> Result<HookOutcome, DataError> {
        match self {
            Self::Refresh => Ok(HookOutcome::Expire),
            Self::Ignore => Ok(HookOutcome::Unchanged),
            Self::Replace => {
                let replaced: Vec<Value> = cached
                    .iter()
                    .map(|entry| match find_object_index(incoming, entry) {
                        Some(index) => incoming[index].clone(),
                        None => entry.clone(),
                    })
                    .collect();
                if replaced == cached {
                    Ok(HookOutcome::Unchanged)
                } else {
                    Ok(HookOutcome::ReplaceList(replaced))
                }
            }
            Self::Unshift => {
                let mut items = incoming.to_vec();
                items.extend(cached.iter().cloned());
                Ok(HookOutcome::ReplaceList(items))
            }
            Self::Push => {
                let mut items = cached.to_vec();
                items.extend(incoming.iter().cloned());
                Ok(HookOutcome::ReplaceList(items))
            }
            Self::Remove => {
                let filtered: Vec<Value> = cached
                    .iter()
                    .filter(|entry| find_object_index(incoming, entry).is_none())
                    .cloned()
                    .collect();
                if filtered.len() == cached.len() {
                    Ok(HookOutcome::Unchanged)
                } else {
                    Ok(HookOutcome::ReplaceList(filtered))
                }
            }
            Self::Custom(hook) => hook(HookInput::List { cached, incoming }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn items(ids: &[i64]) -> Vec<Value> {
        ids.iter().map(|id| json!({"id": id})).collect()
    }

    #[test]
    fn test_replace_on_object() {
        let cached = json!({"id": 1, "name": "a"});
        let incoming = json!({"id": 1, "name": "b"});
        assert_eq!(
            UpdateHook::Replace.apply_to_object(&cached, &incoming).unwrap(),
            HookOutcome::ReplaceObject(incoming.clone())
        );
        assert_eq!(
            UpdateHook::Replace.apply_to_object(&cached, &cached).unwrap(),
            HookOutcome::Unchanged
        );
    }

    #[test]
    fn test_unshift_rejected_on_object() {
        let cached = json!({"id": 1});
        assert!(UpdateHook::Unshift.apply_to_object(&cached, &cached).is_err());
    }

    #[test]
    fn test_push_and_unshift_on_list() {
        let cached = items(&[1, 2]);
        let incoming = items(&[3]);
        assert_eq!(
            UpdateHook::Push.apply_to_list(&cached, &incoming).unwrap(),
            HookOutcome::ReplaceList(items(&[1, 2, 3]))
        );
        assert_eq!(
            UpdateHook::Unshift.apply_to_list(&cached, &incoming).unwrap(),
            HookOutcome::ReplaceList(items(&[3, 1, 2]))
        );
    }

    #[test]
    fn test_remove_filters_matches() {
        let cached = items(&[1, 2, 3]);
        assert_eq!(
            UpdateHook::Remove.apply_to_list(&cached, &items(&[2])).unwrap(),
            HookOutcome::ReplaceList(items(&[1, 3]))
        );
        assert_eq!(
            UpdateHook::Remove.apply_to_list(&cached, &items(&[9])).unwrap(),
            HookOutcome::Unchanged
        );
    }

    #[test]
    fn test_replace_in_list_keeps_positions() {
        let cached = vec![json!({"id": 1, "n": "a"}), json!({"id": 2, "n": "b"})];
        let incoming = vec![json!({"id": 2, "n": "z"})];
        assert_eq!(
            UpdateHook::Replace.apply_to_list(&cached, &incoming).unwrap(),
            HookOutcome::ReplaceList(vec![
                json!({"id": 1, "n": "a"}),
                json!({"id": 2, "n": "z"}),
            ])
        );
    }

    #[test]
    fn test_custom_hook_runs() {
        let hook = UpdateHook::Custom(Arc::new(|input| match input {
            HookInput::List { cached, .. } => Ok(HookOutcome::ReplaceList(
                cached.iter().rev().cloned().collect(),
            )),
            HookInput::Object { .. } => Ok(HookOutcome::Unchanged),
        }));
        assert_eq!(
            hook.apply_to_list(&items(&[1, 2]), &[]).unwrap(),
            HookOutcome::ReplaceList(items(&[2, 1]))
        );
    }

    #[test]
    fn test_hook_equality() {
        assert_eq!(UpdateHook::Refresh, UpdateHook::Refresh);
        assert_ne!(UpdateHook::Refresh, UpdateHook::Ignore);
        let custom = UpdateHook::Custom(Arc::new(|_| Ok(HookOutcome::Unchanged)));
        assert_eq!(custom.clone(), custom);
    }
}
