//! URL canonicalization and matching.
//!
//! Canonical URLs always carry a trailing slash ahead of any query string;
//! every comparison in the cache runs over canonical forms.

use serde_json::Value;

/// Strip the query string, returning only the path portion.
pub fn omit_query(url: &str) -> &str {
    match url.find('?') {
        Some(index) => &url[..index],
        None => url,
    }
}

/// Ensure the path portion of a URL ends with a slash.
pub fn add_trailing_slash(url: &str) -> String {
    let (path, query) = match url.find('?') {
        Some(index) => (&url[..index], Some(&url[index + 1..])),
        None => (url, None),
    };
    if path.ends_with('/') {
        return url.to_string();
    }
    match query {
        Some(query) => format!("{}/?{}", path, query),
        None => format!("{}/", path),
    }
}

/// Resolve a possibly-relative URL against a base URL.
///
/// Absolute URLs pass through untouched; everything else is joined onto the
/// base. The result is canonicalized with a trailing slash.
pub fn absolute_url(base_url: Option<&str>, url: &str) -> String {
    let joined = if is_absolute(url) {
        url.to_string()
    } else {
        match base_url {
            Some(base) => {
                let base = base.trim_end_matches('/');
                if url.starts_with('/') {
                    format!("{}{}", base, url)
                } else {
                    format!("{}/{}", base, url)
                }
            }
            None => url.to_string(),
        }
    };
    add_trailing_slash(&joined)
}

/// Whether a URL carries an explicit scheme.
pub fn is_absolute(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Rewrite `http:` to `https:` when the configured base is HTTPS.
pub fn force_https(url: &str, base_url: Option<&str>) -> String {
    let base_is_https = base_url.map_or(false, |base| base.starts_with("https://"));
    match url.strip_prefix("http://") {
        Some(rest) if base_is_https => format!("https://{}", rest),
        _ => url.to_string(),
    }
}

/// The parent-collection URL of an object URL: everything up to and including
/// the last `/` before the final identifier segment, query string stripped.
pub fn folder_url(url: &str) -> Option<String> {
    let path = omit_query(url);
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    let index = trimmed.rfind('/')?;
    // Refuse to cut into the scheme separator of "https://host".
    if index > 0 && trimmed.as_bytes()[index - 1] == b'/' {
        return None;
    }
    Some(trimmed[..=index].to_string())
}

/// The canonical URL of an object within a folder: `folder + id + '/'` when
/// an identity is present, otherwise the object's own `url` attribute.
pub fn object_url(folder_url: &str, object: &Value) -> Option<String> {
    if let Some(id) = object.get("id") {
        if !id.is_null() {
            return Some(format!("{}{}/", folder_url, id_segment(id)));
        }
    }
    object
        .get("url")
        .and_then(Value::as_str)
        .map(|url| url.to_string())
}

/// The canonical folder URL an object belongs to, preferring the object's own
/// `url` attribute over the supplied fallback folder.
pub fn object_folder_url(fallback_folder: &str, object: &Value) -> String {
    object
        .get("url")
        .and_then(Value::as_str)
        .and_then(folder_url)
        .unwrap_or_else(|| omit_query(fallback_folder).to_string())
}

fn id_segment(id: &Value) -> String {
    match id {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Append a `page` query parameter, except for the first page.
pub fn attach_page_number(url: &str, page: u32) -> String {
    if page <= 1 {
        return url.to_string();
    }
    if url.contains('?') {
        format!("{}&page={}", url, page)
    } else {
        format!("{}?page={}", url, page)
    }
}

/// Whether `url` equals `prefix` or sits under it with a `/` boundary.
pub fn match_url(url: &str, prefix: &str) -> bool {
    if url == prefix {
        return true;
    }
    match url.strip_prefix(prefix) {
        Some(rest) => prefix.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}
