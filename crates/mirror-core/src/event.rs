//! Events emitted toward the host application.
//!
//! The host registers a single [`EventHandler`]; the async trait methods let
//! the host defer its decision, and the decision enums model vetoing the
//! default action.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// A request hit a 401 and needs credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticationEvent {
    /// The URL that was challenged.
    pub url: String,
}

/// A token is about to be recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationEvent {
    pub token: String,
    pub allow_urls: Vec<String>,
    /// Whether the token was freshly obtained from a login, as opposed to
    /// being restored by the host.
    pub fresh: bool,
}

/// A token scope is about to be revoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeauthorizationEvent {
    pub deny_urls: Vec<String>,
}

/// Whether the default action should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDecision {
    Proceed,
    PreventDefault,
}

/// The host's answer to an authentication challenge.
#[derive(Debug, Clone)]
pub enum AuthenticationDecision {
    /// Keep the challenge pending; the host will call `authorize` later.
    Pending,
    /// Decline the challenge; the original 401 is surfaced to the caller.
    Decline,
    /// Supply a token immediately, scoped to the given URL prefixes.
    Token { token: String, allow: Vec<String> },
}

/// Host-side observer for data source events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Cache content changed; cached reads may return different data now.
    async fn on_change(&self) {}

    /// A request needs credentials.
    async fn on_authentication(&self, _event: &AuthenticationEvent) -> AuthenticationDecision {
        AuthenticationDecision::Pending
    }

    /// A token is about to be recorded.
    async fn on_authorization(&self, _event: &AuthorizationEvent) -> EventDecision {
        EventDecision::Proceed
    }

    /// A token scope is about to be revoked.
    async fn on_deauthorization(&self, _event: &DeauthorizationEvent) -> EventDecision {
        EventDecision::Proceed
    }
}

/// Shared slot holding the registered handler.
///
/// The coordinator and the cache both fire events; they share one cell so the
/// host registers a handler exactly once.
#[derive(Clone, Default)]
pub struct HandlerCell {
    inner: Arc<RwLock<Option<Arc<dyn EventHandler>>>>,
}

impl HandlerCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, handler: Arc<dyn EventHandler>) {
        *self.inner.write() = Some(handler);
    }

    pub fn clear(&self) {
        *self.inner.write() = None;
    }

    pub fn get(&self) -> Option<Arc<dyn EventHandler>> {
        self.inner.read().clone()
    }
}
