//! Outbound HTTP
//!
//! - `HttpTransport`: the single seam for issuing a request (reqwest in
//!   production, a scripted mock in tests)
//! - `RateLimiter`: per-domain adaptive spacing with retry and backoff

mod http;
pub mod mock;
pub mod rate_limiter;
#[cfg(test)]
mod tests;

pub use http::ReqwestTransport;
pub use rate_limiter::{domain_of, RateLimiter, RateLimiterConfig, RateLimiterStats};

use crate::cancel::CancelToken;
use crate::error::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

/// Fully resolved request handed to a transport.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Per-call options for `RateLimiter::make_request`.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// 2xx and 3xx count as success.
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends one request. Any HTTP status is an `Ok` response; `Err` is reserved
/// for transport failures (connect, timeout, body read).
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse>;
}
