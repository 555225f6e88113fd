//! Client-side REST data cache and synchronization engine.
//!
//! A [`DataSource`] sits between an application's UI layer and a remote
//! HTTP/JSON service. Read queries are served from an in-memory cache when
//! possible; stale entries are transparently re-fetched; local writes are
//! propagated through every cached query via configurable hooks; 401
//! responses pause the request, solicit credentials from the host through
//! events and replay once a token arrives.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use mirror_source::{DataSource, DataSourceConfig, QueryOptions};
//!
//! let config = DataSourceConfig::new().with_base_url("https://api.example.com");
//! let source = DataSource::new(config, Arc::new(my_transport));
//! source.activate();
//!
//! let items = source.fetch_list("/items/", QueryOptions::new().with_minimum(25)).await?;
//! let item = source.fetch_one("/items/1/", QueryOptions::new()).await?;
//! ```

mod cache;
mod fetch;
mod hooks;
mod mutation;
mod query;
mod refresh;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;

use mirror_core::{ActivityGate, HandlerCell};
use mirror_http::{AuthCoordinator, HttpAdapter};

use crate::cache::CacheState;

pub use crate::hooks::{CustomHook, HookInput, HookOutcome, UpdateHook};
pub use crate::query::{ObjectList, QueryOptions, QueryType};
pub use mirror_core::{
    AuthenticationDecision, AuthenticationEvent, AuthorizationEvent, DataError, DataSourceConfig,
    DeauthorizationEvent, EventDecision, EventHandler, Minimum,
};
pub use mirror_http::{FetchRequest, FetchResponse, Method, Transport, TransportError};

/// Delay before an evicted sibling page is re-fetched.
const PAGE_REFETCH_DELAY: Duration = Duration::from_secs(1);

/// Ceiling for the expiration checker interval.
const EXPIRATION_TICK_CEILING: Duration = Duration::from_millis(100);

pub(crate) struct Inner {
    pub config: DataSourceConfig,
    pub adapter: HttpAdapter,
    pub auth: Arc<AuthCoordinator>,
    pub handler: HandlerCell,
    pub gate: ActivityGate,
    pub state: Mutex<CacheState>,
    pub ticker: Mutex<Option<JoinHandle<()>>>,
}

/// The data cache and synchronization engine.
///
/// Cloning is cheap; every clone shares the same cache and auth tables.
#[derive(Clone)]
pub struct DataSource {
    pub(crate) inner: Arc<Inner>,
}

impl DataSource {
    pub fn new(config: DataSourceConfig, transport: Arc<dyn Transport>) -> Self {
        let handler = HandlerCell::new();
        let gate = ActivityGate::new(false);
        let auth = Arc::new(AuthCoordinator::new(
            transport.clone(),
            handler.clone(),
            config.clone(),
        ));
        let adapter = HttpAdapter::new(
            transport,
            auth.clone(),
            gate.clone(),
            config.authorization_keyword.clone(),
            config.wait_for_authentication,
        );
        Self {
            inner: Arc::new(Inner {
                config,
                adapter,
                auth,
                handler,
                gate,
                state: Mutex::new(CacheState::new()),
                ticker: Mutex::new(None),
            }),
        }
    }

    /// Register the host-side event handler.
    pub fn set_event_handler(&self, handler: Arc<dyn EventHandler>) {
        self.inner.handler.set(handler);
    }

    /// Open the gate for outbound requests and start the expiration checker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn activate(&self) {
        if self.inner.gate.is_active() {
            return;
        }
        self.inner.gate.set_active(true);

        let interval = self.inner.config.refresh_interval;
        if interval.is_zero() {
            return;
        }
        let tick = std::cmp::min(EXPIRATION_TICK_CEILING, interval / 10);
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(tick).await;
                let Some(inner) = weak.upgrade() else { break };
                if !inner.gate.is_active() {
                    break;
                }
                let source = DataSource { inner };
                source.check_expiration().await;
            }
        });
        *self.inner.ticker.lock() = Some(handle);
    }

    /// Close the gate. In-flight transport retries stall until reactivation.
    pub fn deactivate(&self) {
        self.inner.gate.set_active(false);
        if let Some(handle) = self.inner.ticker.lock().take() {
            handle.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.gate.is_active()
    }

    /// Expire every query fetched at or before the cutoff; with no cutoff,
    /// everything. Fires `change` when any query flipped.
    pub async fn invalidate(&self, cutoff: Option<DateTime<Utc>>) -> bool {
        let changed = self.inner.state.lock().invalidate(cutoff);
        if changed {
            self.notify_change().await;
        }
        changed
    }

    /// Expire every cached query under a folder URL. Fires `change` when any
    /// query flipped.
    pub async fn invalidate_folder(&self, url: &str) -> bool {
        let prefix = self.resolve_url(url);
        let changed = self.inner.state.lock().invalidate_under(&prefix);
        if changed {
            self.notify_change().await;
        }
        changed
    }

    /// Whether a URL is served from cache, including via derivation from a
    /// cached collection.
    pub fn is_cached(&self, url: &str) -> bool {
        let abs = self.resolve_url(url);
        self.inner.state.lock().is_cached(&abs, false)
    }

    /// Like [`is_cached`](Self::is_cached), but requires the entry to
    /// actually hold a result.
    pub fn is_cached_deep(&self, url: &str) -> bool {
        let abs = self.resolve_url(url);
        self.inner.state.lock().is_cached(&abs, true)
    }

    /// Cached object for a URL without touching the network.
    pub fn get_cached(&self, url: &str) -> Option<Value> {
        let abs = self.resolve_url(url);
        self.inner.state.lock().peek_object(&abs)
    }

    // --- authentication surface -------------------------------------------

    /// Whether a non-invalid token covers the URL.
    pub fn is_authorized(&self, url: &str) -> bool {
        self.inner.auth.is_authorized(&self.resolve_url(url))
    }

    /// POST credentials to the login URL and record the returned token for
    /// the given scope.
    pub async fn authenticate(
        &self,
        login_url: &str,
        credentials: &Value,
        allow_urls: &[String],
    ) -> Result<bool, DataError> {
        self.inner
            .auth
            .authenticate(login_url, credentials, allow_urls)
            .await
    }

    /// Record a token for the given scope, resolving pending challenges.
    pub async fn authorize(
        &self,
        token: &str,
        allow_urls: &[String],
        fresh: bool,
    ) -> Result<bool, DataError> {
        self.inner.auth.authorize(token, allow_urls, fresh).await
    }

    /// Abandon pending challenges; their requesters see the original 401.
    pub fn cancel_authentication(&self, urls: &[String]) {
        self.inner.auth.cancel_authentication(urls);
    }

    /// Narrow recorded token scopes.
    pub async fn cancel_authorization(&self, deny_urls: &[String]) {
        self.inner.auth.cancel_authorization(deny_urls).await;
    }

    /// POST the logout URL, drop the revoked scope and evict every cached
    /// query under it.
    pub async fn revoke_authorization(
        &self,
        logout_url: &str,
        deny_urls: &[String],
    ) -> Result<bool, DataError> {
        let deny = self.resolve_urls(deny_urls);
        let proceeded = self
            .inner
            .auth
            .revoke_authorization(logout_url, &deny)
            .await?;
        if proceeded {
            self.inner.state.lock().evict_under(&deny);
            self.notify_change().await;
        }
        Ok(proceeded)
    }

    // --- internals --------------------------------------------------------

    pub(crate) fn resolve_url(&self, url: &str) -> String {
        self.inner.config.resolve_url(url)
    }

    fn resolve_urls(&self, urls: &[String]) -> Vec<String> {
        urls.iter().map(|url| self.resolve_url(url)).collect()
    }

    pub(crate) async fn notify_change(&self) {
        if let Some(handler) = self.inner.handler.get() {
            handler.on_change().await;
        }
    }

    async fn check_expiration(&self) {
        let Ok(age) = chrono::Duration::from_std(self.inner.config.refresh_interval) else {
            return;
        };
        self.invalidate(Some(Utc::now() - age)).await;
    }
}
