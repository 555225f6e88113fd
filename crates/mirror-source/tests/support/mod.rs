//! Shared fixtures: a scripted REST backend and a recording event handler.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use mirror_http::mock::MockTransport;
use mirror_http::{FetchRequest, FetchResponse, Method};
use mirror_source::{AuthenticationDecision, AuthenticationEvent, EventHandler};

/// Event handler counting changes and answering challenges with a canned
/// decision.
pub struct RecordingHandler {
    changes: AtomicUsize,
    authentications: AtomicUsize,
    decision: Mutex<AuthenticationDecision>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Self::with_decision(AuthenticationDecision::Pending)
    }

    pub fn with_decision(decision: AuthenticationDecision) -> Arc<Self> {
        Arc::new(Self {
            changes: AtomicUsize::new(0),
            authentications: AtomicUsize::new(0),
            decision: Mutex::new(decision),
        })
    }

    pub fn changes(&self) -> usize {
        self.changes.load(Ordering::SeqCst)
    }

    pub fn authentications(&self) -> usize {
        self.authentications.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn on_change(&self) {
        self.changes.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_authentication(&self, _event: &AuthenticationEvent) -> AuthenticationDecision {
        self.authentications.fetch_add(1, Ordering::SeqCst);
        self.decision.lock().clone()
    }
}

/// In-memory collection served over the mock transport.
pub struct ItemStore {
    pub folder: String,
    items: Mutex<Vec<Value>>,
    page_size: Option<usize>,
}

impl ItemStore {
    pub fn new(folder: &str, items: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            folder: folder.to_string(),
            items: Mutex::new(items),
            page_size: None,
        })
    }

    pub fn paginated(folder: &str, items: Vec<Value>, page_size: usize) -> Arc<Self> {
        Arc::new(Self {
            folder: folder.to_string(),
            items: Mutex::new(items),
            page_size: Some(page_size),
        })
    }

    pub fn items(&self) -> Vec<Value> {
        self.items.lock().clone()
    }

    pub fn set_items(&self, items: Vec<Value>) {
        *self.items.lock() = items;
    }

    pub fn push(&self, item: Value) {
        self.items.lock().push(item);
    }

    fn find_index(&self, id: &str) -> Option<usize> {
        self.items
            .lock()
            .iter()
            .position(|item| item_id(item).as_deref() == Some(id))
    }

    pub fn respond(&self, request: &FetchRequest) -> Option<FetchResponse> {
        let (path, query) = split_query(&request.url);
        if path == self.folder {
            return Some(self.respond_collection(request, query));
        }
        let tail = path.strip_prefix(self.folder.as_str())?;
        let id = tail.strip_suffix('/')?;
        Some(self.respond_item(request, id))
    }

    fn respond_collection(&self, request: &FetchRequest, query: Option<&str>) -> FetchResponse {
        match request.method {
            Method::Get => {
                let items = self.items.lock();
                match self.page_size {
                    None => FetchResponse::json(200, &Value::Array(items.clone())),
                    Some(page_size) => {
                        let page = page_number(query);
                        let start = (page - 1) * page_size;
                        let slice: Vec<Value> =
                            items.iter().skip(start).take(page_size).cloned().collect();
                        let next = if start + page_size < items.len() {
                            Value::String(format!("{}?page={}", self.folder, page + 1))
                        } else {
                            Value::Null
                        };
                        FetchResponse::json(
                            200,
                            &json!({
                                "count": items.len(),
                                "results": slice,
                                "next": next,
                            }),
                        )
                    }
                }
            }
            Method::Post => {
                let Some(body) = &request.body else {
                    return FetchResponse::new(400, Vec::new());
                };
                let mut created = body.clone();
                if created.get("id").map_or(true, Value::is_null) {
                    let next_id = self
                        .items
                        .lock()
                        .iter()
                        .filter_map(|item| item.get("id").and_then(Value::as_i64))
                        .max()
                        .unwrap_or(0)
                        + 1;
                    created["id"] = json!(next_id);
                }
                self.items.lock().push(created.clone());
                FetchResponse::json(201, &created)
            }
            _ => FetchResponse::new(405, Vec::new()),
        }
    }

    fn respond_item(&self, request: &FetchRequest, id: &str) -> FetchResponse {
        let index = self.find_index(id);
        match (request.method, index) {
            (Method::Get, Some(index)) => FetchResponse::json(200, &self.items.lock()[index]),
            (Method::Put, Some(index)) => {
                let Some(body) = &request.body else {
                    return FetchResponse::new(400, Vec::new());
                };
                self.items.lock()[index] = body.clone();
                FetchResponse::json(200, body)
            }
            (Method::Delete, Some(index)) => {
                self.items.lock().remove(index);
                FetchResponse::no_content()
            }
            _ => FetchResponse::new(404, Vec::new()),
        }
    }
}

/// Mock transport routing requests to one or more item stores.
pub fn rest_transport(stores: Vec<Arc<ItemStore>>) -> Arc<MockTransport> {
    Arc::new(MockTransport::new(move |request| {
        for store in &stores {
            if let Some(response) = store.respond(request) {
                return Ok(response);
            }
        }
        Ok(FetchResponse::new(404, Vec::new()))
    }))
}

pub fn item(id: i64, name: &str) -> Value {
    json!({"id": id, "name": name})
}

/// Poll until the handler has seen at least `count` change events.
pub async fn wait_for_changes(handler: &RecordingHandler, count: usize) {
    for _ in 0..200 {
        if handler.changes() >= count {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!(
        "timed out waiting for {} change events, saw {}",
        count,
        handler.changes()
    );
}

fn item_id(item: &Value) -> Option<String> {
    match item.get("id") {
        Some(Value::String(text)) => Some(text.clone()),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    }
}

fn split_query(url: &str) -> (&str, Option<&str>) {
    match url.find('?') {
        Some(index) => (&url[..index], Some(&url[index + 1..])),
        None => (url, None),
    }
}

fn page_number(query: Option<&str>) -> usize {
    query
        .and_then(|query| {
            query
                .split('&')
                .find_map(|pair| pair.strip_prefix("page="))
        })
        .and_then(|page| page.parse().ok())
        .unwrap_or(1)
}
