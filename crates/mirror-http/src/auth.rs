//! Authentication coordinator.
//!
//! Keeps the pending-challenge table and the token table. Challenges are
//! serialized per URL: concurrent 401s on the same URL share one event and
//! one completion. Tokens are scoped by allow/deny URL-prefix sets.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use mirror_core::url::match_url;
use mirror_core::{
    AuthenticationDecision, AuthenticationEvent, AuthorizationEvent, Completion, DataError,
    DataSourceConfig, DeauthorizationEvent, Deferred, EventDecision, HandlerCell,
};

use crate::transport::{FetchRequest, Method, Transport};

struct Challenge {
    url: String,
    deferred: Deferred<Option<String>>,
}

struct Authorization {
    token: String,
    allow: Vec<String>,
    deny: Vec<String>,
    invalid: bool,
}

#[derive(Default)]
struct AuthTables {
    challenges: Vec<Challenge>,
    authorizations: Vec<Authorization>,
}

/// Coordinates 401 challenges and token scoping.
///
/// Every URL or URL prefix handed in is canonicalized against the configured
/// base before it is compared or stored.
pub struct AuthCoordinator {
    transport: Arc<dyn Transport>,
    handler: HandlerCell,
    config: DataSourceConfig,
    tables: Mutex<AuthTables>,
}

enum ChallengeRole {
    /// Another caller already opened the challenge; share its completion.
    Waiter(Completion<Option<String>>),
    /// This caller opened the challenge and must fire the event.
    Initiator(Completion<Option<String>>),
}

impl AuthCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        handler: HandlerCell,
        config: DataSourceConfig,
    ) -> Self {
        Self {
            transport,
            handler,
            config,
            tables: Mutex::new(AuthTables::default()),
        }
    }

    fn resolve_urls(&self, urls: &[String]) -> Vec<String> {
        urls.iter().map(|url| self.config.resolve_url(url)).collect()
    }

    /// The token covering a URL, if a non-invalid record allows it and no
    /// deny prefix matches.
    pub fn get_token(&self, url: &str) -> Option<String> {
        let tables = self.tables.lock();
        tables
            .authorizations
            .iter()
            .find(|auth| {
                !auth.invalid
                    && auth.allow.iter().any(|prefix| match_url(url, prefix))
                    && !auth.deny.iter().any(|prefix| match_url(url, prefix))
            })
            .map(|auth| auth.token.clone())
    }

    pub fn is_authorized(&self, url: &str) -> bool {
        self.get_token(url).is_some()
    }

    /// Mark a token invalid after the server rejected it.
    pub fn mark_token_invalid(&self, token: &str) {
        let mut tables = self.tables.lock();
        for auth in &mut tables.authorizations {
            if auth.token == token {
                auth.invalid = true;
            }
        }
    }

    /// Open (or join) the challenge for a URL and wait for a token.
    ///
    /// The challenge record is inserted before the `authentication` event
    /// fires, so a handler may resolve it synchronously through `authorize`.
    /// Returns `None` when the challenge was declined or cancelled.
    pub async fn request_authentication(&self, url: &str) -> Option<String> {
        let role = {
            let mut tables = self.tables.lock();
            match tables.challenges.iter().find(|entry| entry.url == url) {
                Some(existing) => ChallengeRole::Waiter(existing.deferred.completion()),
                None => {
                    let deferred = Deferred::new();
                    let completion = deferred.completion();
                    tables.challenges.push(Challenge {
                        url: url.to_string(),
                        deferred,
                    });
                    ChallengeRole::Initiator(completion)
                }
            }
        };
        let completion = match role {
            ChallengeRole::Waiter(completion) => return completion.wait().await.flatten(),
            ChallengeRole::Initiator(completion) => completion,
        };

        let event = AuthenticationEvent {
            url: url.to_string(),
        };
        let decision = match self.handler.get() {
            Some(handler) => handler.on_authentication(&event).await,
            None => AuthenticationDecision::Pending,
        };
        match decision {
            AuthenticationDecision::Decline => {
                self.cancel_authentication(std::slice::from_ref(&event.url));
                None
            }
            AuthenticationDecision::Token { token, allow } => {
                if let Err(error) = self.authorize(&token, &allow, true).await {
                    tracing::warn!(%error, url, "authorization from challenge handler failed");
                }
                completion.wait().await.flatten()
            }
            AuthenticationDecision::Pending => completion.wait().await.flatten(),
        }
    }

    /// POST credentials to the login URL, extract the token and record it.
    pub async fn authenticate(
        &self,
        login_url: &str,
        credentials: &Value,
        allow_urls: &[String],
    ) -> Result<bool, DataError> {
        let login_url = self.config.resolve_url(login_url);
        let request = FetchRequest::new(Method::Post, login_url).with_body(credentials.clone());
        let response = self
            .transport
            .fetch(request)
            .await
            .map_err(|error| DataError::Transport(error.to_string()))?;
        if !response.is_success() {
            return Err(DataError::http(response.status, response.status_text));
        }
        let body = response.decode()?.unwrap_or(Value::Null);
        let token = match body.get("key").and_then(Value::as_str) {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => return Err(DataError::no_authorization_token()),
        };
        self.authorize(&token, allow_urls, true).await
    }

    /// Record a token scoped to the given URL prefixes.
    ///
    /// Pending challenges matching the scope are resolved before this call
    /// returns. Returns false when the token is already known or a handler
    /// prevented the default.
    pub async fn authorize(
        &self,
        token: &str,
        allow_urls: &[String],
        fresh: bool,
    ) -> Result<bool, DataError> {
        let allow_urls = self.resolve_urls(allow_urls);
        {
            let tables = self.tables.lock();
            if tables
                .authorizations
                .iter()
                .any(|auth| auth.token == token && !auth.invalid)
            {
                return Ok(false);
            }
        }
        let event = AuthorizationEvent {
            token: token.to_string(),
            allow_urls: allow_urls.to_vec(),
            fresh,
        };
        if let Some(handler) = self.handler.get() {
            if handler.on_authorization(&event).await == EventDecision::PreventDefault {
                return Ok(false);
            }
        }
        {
            let mut tables = self.tables.lock();
            for auth in &mut tables.authorizations {
                auth.allow.retain(|prefix| !allow_urls.contains(prefix));
            }
            tables.authorizations.retain(|auth| !auth.allow.is_empty());
            tables.authorizations.push(Authorization {
                token: token.to_string(),
                allow: allow_urls.to_vec(),
                deny: Vec::new(),
                invalid: false,
            });
            let mut index = 0;
            while index < tables.challenges.len() {
                let matched = allow_urls
                    .iter()
                    .any(|prefix| match_url(&tables.challenges[index].url, prefix));
                if matched {
                    let mut challenge = tables.challenges.remove(index);
                    challenge.deferred.resolve(Some(token.to_string()));
                } else {
                    index += 1;
                }
            }
        }
        self.notify_change().await;
        Ok(true)
    }

    /// Drop pending challenges, resolving their waiters with `None`.
    pub fn cancel_authentication(&self, urls: &[String]) {
        let urls = self.resolve_urls(urls);
        let mut tables = self.tables.lock();
        let mut index = 0;
        while index < tables.challenges.len() {
            if urls.iter().any(|url| url == &tables.challenges[index].url) {
                let mut challenge = tables.challenges.remove(index);
                challenge.deferred.resolve(None);
            } else {
                index += 1;
            }
        }
    }

    /// Narrow token scopes: exact allow entries are removed, covered URLs are
    /// added to the deny set, emptied records are dropped.
    pub async fn cancel_authorization(&self, deny_urls: &[String]) {
        let deny_urls = self.resolve_urls(deny_urls);
        if self.apply_denials(&deny_urls) {
            self.notify_change().await;
        }
    }

    /// POST the logout URL and drop the revoked scope.
    ///
    /// Returns whether the default action ran; the caller evicts cached
    /// queries under the revoked scope when it did.
    pub async fn revoke_authorization(
        &self,
        logout_url: &str,
        deny_urls: &[String],
    ) -> Result<bool, DataError> {
        let logout_url = self.config.resolve_url(logout_url);
        let deny_urls = self.resolve_urls(deny_urls);
        let token = self.get_token(&logout_url);
        let mut request = FetchRequest::new(Method::Post, logout_url).with_body(json!({}));
        if let Some(token) = &token {
            request = request.with_header(
                "Authorization",
                format!("{} {}", self.config.authorization_keyword, token),
            );
        }
        let response = self
            .transport
            .fetch(request)
            .await
            .map_err(|error| DataError::Transport(error.to_string()))?;
        if !response.is_success() {
            return Err(DataError::http(response.status, response.status_text));
        }
        let event = DeauthorizationEvent {
            deny_urls: deny_urls.to_vec(),
        };
        if let Some(handler) = self.handler.get() {
            if handler.on_deauthorization(&event).await == EventDecision::PreventDefault {
                return Ok(false);
            }
        }
        self.apply_denials(&deny_urls);
        Ok(true)
    }

    fn apply_denials(&self, deny_urls: &[String]) -> bool {
        let mut tables = self.tables.lock();
        let mut changed = false;
        for auth in &mut tables.authorizations {
            for deny in deny_urls {
                if let Some(position) = auth.allow.iter().position(|prefix| prefix == deny) {
                    auth.allow.remove(position);
                    changed = true;
                } else if auth.allow.iter().any(|prefix| match_url(deny, prefix))
                    && !auth.deny.contains(deny)
                {
                    auth.deny.push(deny.clone());
                    changed = true;
                }
            }
        }
        let before = tables.authorizations.len();
        tables.authorizations.retain(|auth| !auth.allow.is_empty());
        changed || tables.authorizations.len() != before
    }

    async fn notify_change(&self) {
        if let Some(handler) = self.handler.get() {
            handler.on_change().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use crate::transport::FetchResponse;
    use async_trait::async_trait;
    use mirror_core::EventHandler;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn coordinator_with(transport: MockTransport) -> (Arc<AuthCoordinator>, HandlerCell) {
        let handler = HandlerCell::new();
        let coordinator = Arc::new(AuthCoordinator::new(
            Arc::new(transport),
            handler.clone(),
            DataSourceConfig::default(),
        ));
        (coordinator, handler)
    }

    fn coordinator() -> (Arc<AuthCoordinator>, HandlerCell) {
        coordinator_with(MockTransport::new(|_| Ok(FetchResponse::no_content())))
    }

    struct CountingHandler {
        authentications: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn on_authentication(&self, _event: &AuthenticationEvent) -> AuthenticationDecision {
            self.authentications.fetch_add(1, Ordering::SeqCst);
            AuthenticationDecision::Pending
        }
    }

    #[tokio::test]
    async fn test_token_scoping() {
        let (coordinator, _handler) = coordinator();
        coordinator
            .authorize("abc", &["https://api.test/".to_string()], true)
            .await
            .unwrap();
        assert_eq!(
            coordinator.get_token("https://api.test/items/1/"),
            Some("abc".to_string())
        );
        assert_eq!(coordinator.get_token("https://other.test/x/"), None);

        coordinator
            .cancel_authorization(&["https://api.test/private/".to_string()])
            .await;
        assert_eq!(coordinator.get_token("https://api.test/private/1/"), None);
        assert_eq!(
            coordinator.get_token("https://api.test/items/1/"),
            Some("abc".to_string())
        );
    }

    #[tokio::test]
    async fn test_invalid_token_is_skipped() {
        let (coordinator, _handler) = coordinator();
        coordinator
            .authorize("abc", &["/".to_string()], true)
            .await
            .unwrap();
        coordinator.mark_token_invalid("abc");
        assert_eq!(coordinator.get_token("/items/"), None);
    }

    #[tokio::test]
    async fn test_known_token_is_not_reauthorized() {
        let (coordinator, _handler) = coordinator();
        assert!(coordinator
            .authorize("abc", &["/".to_string()], true)
            .await
            .unwrap());
        assert!(!coordinator
            .authorize("abc", &["/".to_string()], false)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_challenge_multiplexing() {
        let (coordinator, handler) = coordinator();
        let counting = Arc::new(CountingHandler {
            authentications: AtomicUsize::new(0),
        });
        handler.set(counting.clone());

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let coordinator = coordinator.clone();
            waiters.push(tokio::spawn(async move {
                coordinator.request_authentication("/api/x/").await
            }));
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        coordinator
            .authorize("abc", &["/".to_string()], true)
            .await
            .unwrap();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Some("abc".to_string()));
        }
        assert_eq!(counting.authentications.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_authentication_resolves_none() {
        let (coordinator, _handler) = coordinator();
        let pending = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.request_authentication("/api/x/").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        coordinator.cancel_authentication(&["/api/x/".to_string()]);
        assert_eq!(pending.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_authenticate_extracts_key() {
        let (coordinator, _handler) = coordinator_with(MockTransport::new(|request| {
            assert_eq!(request.url, "/auth/login/");
            Ok(FetchResponse::json(
                200,
                &serde_json::json!({"key": "secret"}),
            ))
        }));
        coordinator
            .authenticate(
                "/auth/login/",
                &serde_json::json!({"username": "u", "password": "p"}),
                &["/".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(coordinator.get_token("/items/"), Some("secret".to_string()));
    }

    #[tokio::test]
    async fn test_authenticate_without_key_fails() {
        let (coordinator, _handler) = coordinator_with(MockTransport::new(|_| {
            Ok(FetchResponse::json(200, &serde_json::json!({"user": 1})))
        }));
        let error = coordinator
            .authenticate("/auth/login/", &serde_json::json!({}), &["/".to_string()])
            .await
            .unwrap_err();
        assert_eq!(error.status(), Some(403));
    }
}
