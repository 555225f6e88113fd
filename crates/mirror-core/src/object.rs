//! Identity-based comparison and merging of opaque JSON objects.
//!
//! Objects are distinguished only by an `id` attribute (preferred) or a `url`
//! attribute; everything else is payload.

use serde_json::Value;

/// Structural deep equality over two JSON values.
pub fn match_object(a: &Value, b: &Value) -> bool {
    a == b
}

/// Locate an object within a list by identity key.
pub fn find_object_index(list: &[Value], object: &Value) -> Option<usize> {
    if let Some(id) = object.get("id") {
        if !id.is_null() {
            return list.iter().position(|entry| entry.get("id") == Some(id));
        }
    }
    if let Some(url) = object.get("url") {
        if !url.is_null() {
            return list.iter().position(|entry| entry.get("url") == Some(url));
        }
    }
    None
}

/// Whether a list contains an object with the same identity key.
pub fn contains_object(list: &[Value], object: &Value) -> bool {
    find_object_index(list, object).is_some()
}

/// Append a page of objects onto an accumulated list, deduplicating by
/// identity. An existing entry that reappears in the new page is dropped from
/// its old position so the incoming page keeps server order.
pub fn append_objects(existing: Option<&[Value]>, incoming: &[Value]) -> Vec<Value> {
    match existing {
        None => incoming.to_vec(),
        Some(existing) => {
            let mut merged: Vec<Value> = existing
                .iter()
                .filter(|entry| !contains_object(incoming, entry))
                .cloned()
                .collect();
            merged.extend(incoming.iter().cloned());
            merged
        }
    }
}

/// Compare a freshly fetched list against the cached one.
///
/// Returns `None` when the two lists are structurally identical, otherwise
/// the subset of incoming objects that are new or differ from their cached
/// counterpart. Entries equal to their cached counterpart are considered
/// unchanged downstream.
pub fn replace_identical_objects(incoming: &[Value], existing: &[Value]) -> Option<Vec<Value>> {
    if incoming == existing {
        return None;
    }
    let fresh = incoming
        .iter()
        .filter(|object| match find_object_index(existing, object) {
            Some(index) => existing[index] != **object,
            None => true,
        })
        .cloned()
        .collect();
    Some(fresh)
}

/// Stitch a re-walked list prefix onto the cached list.
///
/// The largest suffix of the old list that does not intersect the new list is
/// concatenated onto the new list, preserving items the user has already
/// scrolled past but that no longer appear in the re-walked prefix.
pub fn join_object_lists(incoming: &[Value], existing: &[Value]) -> Vec<Value> {
    let mut start = existing.len();
    while start > 0 {
        if contains_object(incoming, &existing[start - 1]) {
            break;
        }
        start -= 1;
    }
    let mut joined = incoming.to_vec();
    joined.extend(existing[start..].iter().cloned());
    joined
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn items(ids: &[i64]) -> Vec<Value> {
        ids.iter().map(|id| json!({"id": id})).collect()
    }

    #[test]
    fn test_find_object_index_by_id() {
        let list = items(&[1, 2, 3]);
        assert_eq!(find_object_index(&list, &json!({"id": 2})), Some(1));
        assert_eq!(find_object_index(&list, &json!({"id": 9})), None);
    }

    #[test]
    fn test_find_object_index_by_url() {
        let list = vec![json!({"url": "/a/1/"}), json!({"url": "/a/2/"})];
        assert_eq!(find_object_index(&list, &json!({"url": "/a/2/"})), Some(1));
    }

    #[test]
    fn test_append_objects_dedupes_by_identity() {
        let first = items(&[1, 2, 3]);
        let merged = append_objects(Some(&first), &items(&[3, 4]));
        let ids: Vec<i64> = merged.iter().map(|o| o["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_replace_identical_objects_no_change() {
        let cached = items(&[1, 2]);
        assert_eq!(replace_identical_objects(&items(&[1, 2]), &cached), None);
    }

    #[test]
    fn test_replace_identical_objects_fresh_subset() {
        let cached = vec![json!({"id": 1, "name": "a"}), json!({"id": 2, "name": "b"})];
        let incoming = vec![json!({"id": 1, "name": "a"}), json!({"id": 2, "name": "z"})];
        let fresh = replace_identical_objects(&incoming, &cached).unwrap();
        assert_eq!(fresh, vec![json!({"id": 2, "name": "z"})]);
    }

    #[test]
    fn test_join_object_lists_preserves_tail() {
        // Items 4 and 5 were scrolled past but fell off the re-walked prefix.
        let cached = items(&[1, 2, 3, 4, 5]);
        let rewalked = items(&[0, 1, 2, 3]);
        let joined = join_object_lists(&rewalked, &cached);
        let ids: Vec<i64> = joined.iter().map(|o| o["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_join_object_lists_full_overlap() {
        let cached = items(&[1, 2, 3]);
        let rewalked = items(&[1, 2, 3]);
        assert_eq!(join_object_lists(&rewalked, &cached), cached);
    }
}
