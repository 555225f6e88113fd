//! HTTP adapter mapping logical operations onto the pluggable transport.
//!
//! The adapter attaches the authorization header, decodes JSON bodies,
//! classifies status codes and drives the single 401 retry.

use std::sync::Arc;

use serde_json::Value;

use mirror_core::{ActivityGate, DataError};

use crate::auth::AuthCoordinator;
use crate::transport::{FetchRequest, FetchResponse, Method, Transport};

/// Logical GET/POST/PUT/DELETE over the pluggable transport.
pub struct HttpAdapter {
    transport: Arc<dyn Transport>,
    auth: Arc<AuthCoordinator>,
    gate: ActivityGate,
    keyword: String,
    wait_for_authentication: bool,
}

impl HttpAdapter {
    pub fn new(
        transport: Arc<dyn Transport>,
        auth: Arc<AuthCoordinator>,
        gate: ActivityGate,
        keyword: String,
        wait_for_authentication: bool,
    ) -> Self {
        Self {
            transport,
            auth,
            gate,
            keyword,
            wait_for_authentication,
        }
    }

    /// GET a URL, requiring a JSON body in the response.
    pub async fn get(&self, url: &str) -> Result<Value, DataError> {
        self.request(Method::Get, url, None)
            .await?
            .ok_or_else(|| DataError::Decode(format!("empty response body from {}", url)))
    }

    /// POST a JSON object, returning the server's representation if any.
    pub async fn post(&self, url: &str, body: &Value) -> Result<Option<Value>, DataError> {
        self.request(Method::Post, url, Some(body)).await
    }

    /// PUT a JSON object, returning the server's representation if any.
    pub async fn put(&self, url: &str, body: &Value) -> Result<Option<Value>, DataError> {
        self.request(Method::Put, url, Some(body)).await
    }

    /// DELETE a URL. Servers typically answer 204.
    pub async fn delete(&self, url: &str) -> Result<Option<Value>, DataError> {
        self.request(Method::Delete, url, None).await
    }

    async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Option<Value>, DataError> {
        let token = self.auth.get_token(url);
        let response = self.dispatch(method, url, body, token.as_deref()).await?;

        if response.status == 401 || response.status == 403 {
            if let Some(token) = &token {
                self.auth.mark_token_invalid(token);
            }
        }
        if response.status == 401 && self.wait_for_authentication {
            tracing::debug!(url, "401 received, soliciting credentials");
            if let Some(fresh) = self.auth.request_authentication(url).await {
                let retry = self.dispatch(method, url, body, Some(&fresh)).await?;
                return Self::decode(retry);
            }
            return Err(DataError::http(response.status, response.status_text));
        }
        Self::decode(response)
    }

    /// Send one request, waiting for activation first. A transport failure
    /// observed while the source is inactive is retried once activation
    /// resumes; a failure while active is surfaced.
    async fn dispatch(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        token: Option<&str>,
    ) -> Result<FetchResponse, DataError> {
        loop {
            self.gate.wait_for_activation().await;
            let mut request = FetchRequest::new(method, url);
            if let Some(token) = token {
                request = request.with_header("Authorization", format!("{} {}", self.keyword, token));
            }
            if let Some(body) = body {
                request = request.with_body(body.clone());
            }
            match self.transport.fetch(request).await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    if !self.gate.is_active() {
                        tracing::debug!(url, %error, "transport failed while inactive, will retry");
                        continue;
                    }
                    return Err(DataError::Transport(error.to_string()));
                }
            }
        }
    }

    fn decode(response: FetchResponse) -> Result<Option<Value>, DataError> {
        if response.is_success() {
            response.decode()
        } else {
            Err(DataError::http(response.status, response.status_text))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use mirror_core::HandlerCell;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn adapter_over(transport: MockTransport) -> (HttpAdapter, Arc<AuthCoordinator>) {
        let transport = Arc::new(transport);
        let handler = HandlerCell::new();
        let auth = Arc::new(AuthCoordinator::new(
            transport.clone(),
            handler,
            mirror_core::DataSourceConfig::default(),
        ));
        let adapter = HttpAdapter::new(
            transport,
            auth.clone(),
            ActivityGate::new(true),
            "Token".to_string(),
            true,
        );
        (adapter, auth)
    }

    #[tokio::test]
    async fn test_get_decodes_json() {
        let (adapter, _auth) =
            adapter_over(MockTransport::new(|_| Ok(FetchResponse::json(200, &json!({"id": 1})))));
        assert_eq!(adapter.get("/api/items/1/").await.unwrap(), json!({"id": 1}));
    }

    #[tokio::test]
    async fn test_delete_accepts_no_content() {
        let (adapter, _auth) =
            adapter_over(MockTransport::new(|_| Ok(FetchResponse::no_content())));
        assert_eq!(adapter.delete("/api/items/1/").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_http_error_carries_status() {
        let (adapter, _auth) =
            adapter_over(MockTransport::new(|_| Ok(FetchResponse::new(404, Vec::new()))));
        let error = adapter.get("/api/items/9/").await.unwrap_err();
        assert_eq!(error.status(), Some(404));
        assert_eq!(error.to_string(), "HTTP 404: Not Found");
    }

    #[tokio::test]
    async fn test_token_attached_to_request() {
        let (adapter, auth) = adapter_over(MockTransport::new(|request| {
            assert_eq!(request.header("Authorization"), Some("Token abc"));
            Ok(FetchResponse::json(200, &json!({"ok": true})))
        }));
        auth.authorize("abc", &["/".to_string()], true).await.unwrap();
        adapter.get("/api/items/").await.unwrap();
    }

    #[tokio::test]
    async fn test_401_retries_once_with_fresh_token() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let transport = MockTransport::new(move |request| {
            seen.fetch_add(1, Ordering::SeqCst);
            match request.header("Authorization") {
                Some("Token abc") => Ok(FetchResponse::json(200, &json!({"ok": true}))),
                _ => Ok(FetchResponse::new(401, Vec::new())),
            }
        });
        let (adapter, auth) = adapter_over(transport);

        let fetch = tokio::spawn({
            let auth = auth.clone();
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                auth.authorize("abc", &["/".to_string()], true).await.unwrap();
            }
        });
        let value = adapter.get("/api/x/").await.unwrap();
        assert_eq!(value, json!({"ok": true}));
        fetch.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_declined_challenge_surfaces_401() {
        let (adapter, auth) = adapter_over(MockTransport::new(|_| {
            Ok(FetchResponse::new(401, Vec::new()))
        }));
        let cancel = tokio::spawn({
            let auth = auth.clone();
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                auth.cancel_authentication(&["/api/x/".to_string()]);
            }
        });
        let error = adapter.get("/api/x/").await.unwrap_err();
        assert_eq!(error.status(), Some(401));
        cancel.await.unwrap();
    }
}
