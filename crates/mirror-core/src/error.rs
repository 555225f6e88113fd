//! Error types shared across the mirror crates.

use serde_json::Value;
use thiserror::Error;

/// Errors surfaced by the data source and its collaborators.
#[derive(Debug, Clone, Error)]
pub enum DataError {
    /// Non-2xx HTTP response.
    #[error("HTTP {status}: {status_text}")]
    Http { status: u16, status_text: String },

    /// The underlying fetch function failed.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A user-supplied update hook failed.
    #[error("update hook failed: {0}")]
    Hook(String),

    /// A URL could not be resolved or decomposed.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// A per-query option is not valid for the query it was attached to.
    #[error("invalid option: {0}")]
    InvalidOption(String),

    /// The response body could not be decoded as JSON.
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// A batch write settled with at least one failure. `results` and
    /// `errors` are aligned with the input; `first` is the first failure.
    #[error("batch operation failed: {first}")]
    Batch {
        results: Vec<Option<Value>>,
        errors: Vec<Option<DataError>>,
        first: Box<DataError>,
    },
}

impl DataError {
    /// Construct an HTTP error from a status code and reason phrase.
    pub fn http(status: u16, status_text: impl Into<String>) -> Self {
        Self::Http {
            status,
            status_text: status_text.into(),
        }
    }

    /// The HTTP status code, when this error carries one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Batch { first, .. } => first.status(),
            _ => None,
        }
    }

    /// The synthesized failure for a login response without a token key.
    pub fn no_authorization_token() -> Self {
        Self::http(403, "No authorization token")
    }
}

impl From<serde_json::Error> for DataError {
    fn from(error: serde_json::Error) -> Self {
        Self::Decode(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_error_display() {
        let error = DataError::http(404, "Not Found");
        assert_eq!(error.to_string(), "HTTP 404: Not Found");
        assert_eq!(error.status(), Some(404));
    }

    #[test]
    fn test_batch_error_reports_first() {
        let first = DataError::http(409, "Conflict");
        let error = DataError::Batch {
            results: vec![None],
            errors: vec![Some(first.clone())],
            first: Box::new(first),
        };
        assert_eq!(error.status(), Some(409));
    }
}
