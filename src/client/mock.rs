//! Scripted HTTP transport for testing
//!
//! Replies are queued per URL and consumed in order; once a URL's queue is
//! empty its fallback reply (or `200 []`) is used. Every request is recorded
//! with the tokio clock so spacing can be asserted under a paused runtime.

use super::{HttpRequest, HttpResponse, HttpTransport};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub enum MockReply {
    Status(u16),
    Json(serde_json::Value),
    NetworkError(String),
}

impl MockReply {
    fn into_result(self) -> Result<HttpResponse> {
        match self {
            MockReply::Status(status) => Ok(HttpResponse { status, body: Vec::new() }),
            MockReply::Json(value) => Ok(HttpResponse {
                status: 200,
                body: serde_json::to_vec(&value)?,
            }),
            MockReply::NetworkError(msg) => Err(PipelineError::Network(msg)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub at: Instant,
}

/// Mock transport for tests and dry runs
#[derive(Default)]
pub struct MockTransport {
    queued: Mutex<HashMap<String, VecDeque<MockReply>>>,
    fallback: Mutex<HashMap<String, MockReply>>,
    log: Mutex<Vec<RecordedRequest>>,
    latency: Duration,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated response time for every request.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue one reply for `url`.
    pub fn push(&self, url: &str, reply: MockReply) {
        self.queued
            .lock()
            .entry(url.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Reply used for `url` whenever its queue is empty.
    pub fn set_fallback(&self, url: &str, reply: MockReply) {
        self.fallback.lock().insert(url.to_string(), reply);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.log.lock().clone()
    }

    pub fn request_times(&self, url: &str) -> Vec<Instant> {
        self.log
            .lock()
            .iter()
            .filter(|r| r.url == url)
            .map(|r| r.at)
            .collect()
    }

    pub fn request_count(&self, url: &str) -> usize {
        self.log.lock().iter().filter(|r| r.url == url).count()
    }

    fn next_reply(&self, url: &str) -> MockReply {
        if let Some(reply) = self.queued.lock().get_mut(url).and_then(VecDeque::pop_front) {
            return reply;
        }
        self.fallback
            .lock()
            .get(url)
            .cloned()
            .unwrap_or_else(|| MockReply::Json(serde_json::Value::Array(Vec::new())))
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        self.log.lock().push(RecordedRequest {
            url: request.url.clone(),
            headers: request.headers.clone(),
            at: Instant::now(),
        });

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        self.next_reply(&request.url).into_result()
    }
}
