//! Data source configuration.

use std::time::Duration;

use crate::url;

/// Configuration for a data source instance.
#[derive(Debug, Clone)]
pub struct DataSourceConfig {
    /// Prefix for relative URLs.
    pub base_url: Option<String>,
    /// How long a cached query stays fresh. Zero disables expiration.
    pub refresh_interval: Duration,
    /// HTTP scheme token for the `Authorization` header.
    pub authorization_keyword: String,
    /// Treat list/page results as abbreviated by default, making them
    /// unusable for deriving object queries.
    pub abbreviated_folder_contents: bool,
    /// Rewrite outgoing `http:` URLs to `https:` when the base is HTTPS.
    pub force_https: bool,
    /// Intercept 401 responses and solicit credentials from the host instead
    /// of surfacing the error.
    pub wait_for_authentication: bool,
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            refresh_interval: Duration::ZERO,
            authorization_keyword: "Token".to_string(),
            abbreviated_folder_contents: false,
            force_https: false,
            wait_for_authentication: true,
        }
    }
}

impl DataSourceConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base URL for relative requests.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Set the refresh interval.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Set the authorization scheme keyword.
    pub fn with_authorization_keyword(mut self, keyword: impl Into<String>) -> Self {
        self.authorization_keyword = keyword.into();
        self
    }

    /// Mark folder contents as abbreviated by default.
    pub fn with_abbreviated_folder_contents(mut self, abbreviated: bool) -> Self {
        self.abbreviated_folder_contents = abbreviated;
        self
    }

    /// Enable HTTPS rewriting.
    pub fn with_force_https(mut self, force: bool) -> Self {
        self.force_https = force;
        self
    }

    /// Control 401 interception.
    pub fn with_wait_for_authentication(mut self, wait: bool) -> Self {
        self.wait_for_authentication = wait;
        self
    }

    /// Canonicalize a URL against this configuration: resolve against the
    /// base, apply the HTTPS rewrite, attach the trailing slash.
    pub fn resolve_url(&self, value: &str) -> String {
        let absolute = url::absolute_url(self.base_url.as_deref(), value);
        if self.force_https {
            url::force_https(&absolute, self.base_url.as_deref())
        } else {
            absolute
        }
    }
}
