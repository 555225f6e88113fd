//! Scripted transport for development and testing.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::transport::{FetchRequest, FetchResponse, Transport, TransportError};

type Responder = dyn Fn(&FetchRequest) -> Result<FetchResponse, TransportError> + Send + Sync;

/// A transport backed by a closure, recording every request it sees.
pub struct MockTransport {
    responder: Box<Responder>,
    requests: Mutex<Vec<FetchRequest>>,
}

impl MockTransport {
    pub fn new(
        responder: impl Fn(&FetchRequest) -> Result<FetchResponse, TransportError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every request dispatched so far, in order.
    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// How many requests hit the given URL.
    pub fn count_for(&self, url: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|request| request.url == url)
            .count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransportError> {
        self.requests.lock().push(request.clone());
        (self.responder)(&request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Method;
    use serde_json::json;

    #[tokio::test]
    async fn test_mock_records_requests() {
        let mock = MockTransport::new(|_| Ok(FetchResponse::json(200, &json!({"ok": true}))));
        let response = mock
            .fetch(FetchRequest::new(Method::Get, "/api/x/"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(mock.request_count(), 1);
        assert_eq!(mock.count_for("/api/x/"), 1);
    }
}
