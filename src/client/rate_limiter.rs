//! Per-domain adaptive rate limiter
//!
//! Each domain keeps its own delay, request/error counters and the time of
//! its last reserved slot. Callers reserve a slot under the domain lock and
//! sleep after releasing it, so only same-domain requests queue.
//!
//! Delay adaptation:
//! - fast success (< 1s): `delay * 0.95`, floored at half the base delay
//! - retryable failure: `delay * 1.5`, capped at ten times the base delay
//! - error rate above 10%: the wait is additionally scaled by `1 + rate`

use super::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, RequestOptions};
use crate::cancel::{sleep_or_cancel, CancelToken};
use crate::config::PipelineOptions;
use crate::error::{PipelineError, Result};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const DEFAULT_DOMAIN: &str = "default";
const FAST_RESPONSE: Duration = Duration::from_secs(1);
const SHRINK_FACTOR: f64 = 0.95;
const GROW_FACTOR: f64 = 1.5;
const MIN_DELAY_RATIO: f64 = 0.5;
const MAX_DELAY_RATIO: f64 = 10.0;
const ERROR_RATE_THRESHOLD: f64 = 0.1;
const JITTER: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub default_delay: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
    pub backoff_factor: f64,
    pub jitter: bool,
    pub user_agent: String,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::from(&PipelineOptions::default())
    }
}

impl From<&PipelineOptions> for RateLimiterConfig {
    fn from(opts: &PipelineOptions) -> Self {
        Self {
            default_delay: opts.rate_limit_delay(),
            max_retries: opts.max_retries,
            backoff_factor: opts.backoff_factor,
            jitter: opts.jitter,
            user_agent: opts.user_agent.clone(),
        }
    }
}

#[derive(Debug)]
struct DomainState {
    base_delay: Duration,
    current_delay: Duration,
    last_request: Option<Instant>,
    request_count: u64,
    error_count: u64,
}

impl DomainState {
    fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            current_delay: base_delay,
            last_request: None,
            request_count: 0,
            error_count: 0,
        }
    }

    fn error_rate(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.request_count as f64
        }
    }

    fn required_delay(&self) -> Duration {
        let rate = self.error_rate();
        if rate > ERROR_RATE_THRESHOLD {
            scale(self.current_delay, 1.0 + rate)
        } else {
            self.current_delay
        }
    }

    fn on_success(&mut self, elapsed: Duration) {
        if elapsed < FAST_RESPONSE {
            let floor = scale(self.base_delay, MIN_DELAY_RATIO);
            self.current_delay = scale(self.current_delay, SHRINK_FACTOR).max(floor);
        }
    }

    fn on_failure(&mut self) {
        let cap = scale(self.base_delay, MAX_DELAY_RATIO);
        self.current_delay = scale(self.current_delay, GROW_FACTOR).min(cap);
        self.error_count += 1;
    }
}

#[derive(Debug, Default)]
struct Totals {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    retries: u64,
    rate_limit_hits: u64,
    total_delay: Duration,
}

/// Snapshot of limiter counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub retries: u64,
    pub rate_limit_hits: u64,
    /// Seconds spent waiting for slots
    pub total_delay_time: f64,
    pub success_rate_percent: f64,
    pub average_delay_per_request: f64,
    pub domain_delays: BTreeMap<String, f64>,
    pub domain_request_counts: BTreeMap<String, u64>,
    pub domain_error_counts: BTreeMap<String, u64>,
}

/// Wraps an `HttpTransport` with per-domain spacing and retries.
pub struct RateLimiter {
    transport: Arc<dyn HttpTransport>,
    config: RateLimiterConfig,
    /// The table lock is held only to look up a domain's own lock.
    domains: Mutex<HashMap<String, Arc<Mutex<DomainState>>>>,
    totals: Mutex<Totals>,
}

impl RateLimiter {
    pub fn new(transport: Arc<dyn HttpTransport>, config: RateLimiterConfig) -> Self {
        Self {
            transport,
            config,
            domains: Mutex::new(HashMap::new()),
            totals: Mutex::new(Totals::default()),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Issue a request with spacing, classification and retries.
    ///
    /// 2xx/3xx return the response. 429/500/502/503/504 and transport errors
    /// are retried up to `max_retries` times and then surface as
    /// `RetriesExhausted`. Any other status fails immediately with `Http`;
    /// every 5xx grows the domain delay, retried or not.
    pub async fn make_request(
        &self,
        url: &str,
        method: HttpMethod,
        opts: RequestOptions,
    ) -> Result<HttpResponse> {
        let domain = domain_of(url);
        let cancel = opts.cancel.clone();
        let request = self.build_request(url, method, opts);
        let mut attempt: u32 = 0;

        loop {
            check_cancel(cancel.as_ref())?;
            self.wait_for_slot(&domain, cancel.as_ref()).await?;

            self.totals.lock().total_requests += 1;
            let started = Instant::now();
            let outcome = self.transport.send(&request).await;
            let elapsed = started.elapsed();

            let err = match outcome {
                Ok(resp) if resp.is_success() => {
                    self.domain_state(&domain).lock().on_success(elapsed);
                    self.totals.lock().successful_requests += 1;
                    debug!("{} {} in {:?}", resp.status, url, elapsed);
                    return Ok(resp);
                }
                Ok(resp) => PipelineError::Http {
                    status: resp.status,
                    url: url.to_string(),
                },
                Err(e) => e,
            };

            if matches!(err, PipelineError::Http { status: 429, .. }) {
                self.totals.lock().rate_limit_hits += 1;
            }

            if !err.is_retryable() {
                // Server errors slow the domain even when not retried
                if matches!(err, PipelineError::Http { status, .. } if status >= 500) {
                    self.domain_state(&domain).lock().on_failure();
                }
                self.totals.lock().failed_requests += 1;
                warn!("Request to {} failed without retry: {}", url, err);
                return Err(err);
            }

            self.domain_state(&domain).lock().on_failure();

            if attempt >= self.config.max_retries {
                self.totals.lock().failed_requests += 1;
                warn!("Giving up on {} after {} attempts: {}", url, attempt + 1, err);
                return Err(PipelineError::RetriesExhausted {
                    url: url.to_string(),
                    attempts: attempt + 1,
                    last: Box::new(err),
                });
            }

            let wait = self.jittered(self.retry_delay(&domain, attempt));
            warn!(
                "Attempt {}/{} for {} failed ({}), retrying in {:.2}s",
                attempt + 1,
                self.config.max_retries + 1,
                url,
                err,
                wait.as_secs_f64()
            );
            {
                let mut totals = self.totals.lock();
                totals.retries += 1;
                totals.total_delay += wait;
            }
            check_cancel(cancel.as_ref())?;
            sleep_or_cancel(wait, cancel.as_ref(), "retry backoff").await?;
            attempt += 1;
        }
    }

    /// Backoff before retry number `attempt + 1`: the domain's current delay
    /// times `backoff_factor ^ attempt`. Jitter is applied by the caller.
    pub fn retry_delay(&self, domain: &str, attempt: u32) -> Duration {
        let current = self.current_delay(domain);
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        scale(current, self.config.backoff_factor.powi(exponent))
    }

    /// Override the base delay for one domain and reset its adaptive delay.
    pub fn set_domain_delay(&self, domain: &str, delay: Duration) {
        let state = self.domain_state(&domain.to_ascii_lowercase());
        let mut state = state.lock();
        state.base_delay = delay;
        state.current_delay = delay;
        info!("Set delay for {} to {:.2}s", domain, delay.as_secs_f64());
    }

    pub fn current_delay(&self, domain: &str) -> Duration {
        let domain = domain.to_ascii_lowercase();
        let existing = self.domains.lock().get(&domain).cloned();
        match existing {
            Some(state) => state.lock().current_delay,
            None => self.config.default_delay,
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        let mut stats = {
            let totals = self.totals.lock();
            let success_rate = if totals.total_requests > 0 {
                totals.successful_requests as f64 / totals.total_requests as f64 * 100.0
            } else {
                0.0
            };
            let average_delay = if totals.total_requests > 0 {
                totals.total_delay.as_secs_f64() / totals.total_requests as f64
            } else {
                0.0
            };
            RateLimiterStats {
                total_requests: totals.total_requests,
                successful_requests: totals.successful_requests,
                failed_requests: totals.failed_requests,
                retries: totals.retries,
                rate_limit_hits: totals.rate_limit_hits,
                total_delay_time: totals.total_delay.as_secs_f64(),
                success_rate_percent: success_rate,
                average_delay_per_request: average_delay,
                ..Default::default()
            }
        };

        let domains: Vec<(String, Arc<Mutex<DomainState>>)> = self
            .domains
            .lock()
            .iter()
            .map(|(name, state)| (name.clone(), Arc::clone(state)))
            .collect();
        for (name, state) in domains {
            let state = state.lock();
            stats.domain_delays.insert(name.clone(), state.current_delay.as_secs_f64());
            stats.domain_request_counts.insert(name.clone(), state.request_count);
            stats.domain_error_counts.insert(name, state.error_count);
        }
        stats
    }

    /// Zero the counters. Adaptive delays are kept.
    pub fn reset_stats(&self) {
        *self.totals.lock() = Totals::default();
        for state in self.domains.lock().values() {
            let mut state = state.lock();
            state.request_count = 0;
            state.error_count = 0;
        }
        info!("Rate limiter statistics reset");
    }

    /// Reserve the domain's next slot and sleep until it opens.
    async fn wait_for_slot(&self, domain: &str, cancel: Option<&CancelToken>) -> Result<()> {
        let state = self.domain_state(domain);
        let wait = {
            let mut state = state.lock();
            let now = Instant::now();
            let delay = self.jittered(state.required_delay());
            let slot = match state.last_request {
                Some(last) => last.checked_add(delay).map_or(now, |t| t.max(now)),
                None => now,
            };
            state.last_request = Some(slot);
            state.request_count += 1;
            slot - now
        };

        if !wait.is_zero() {
            debug!("Rate limiting {}: waiting {:.2}s", domain, wait.as_secs_f64());
            self.totals.lock().total_delay += wait;
            sleep_or_cancel(wait, cancel, "rate limit wait").await?;
        }
        Ok(())
    }

    fn domain_state(&self, domain: &str) -> Arc<Mutex<DomainState>> {
        let mut domains = self.domains.lock();
        domains
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(DomainState::new(self.config.default_delay))))
            .clone()
    }

    fn build_request(&self, url: &str, method: HttpMethod, opts: RequestOptions) -> HttpRequest {
        let mut headers = opts.headers;
        if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("user-agent")) {
            headers.push(("User-Agent".to_string(), self.config.user_agent.clone()));
        }
        HttpRequest {
            method,
            url: url.to_string(),
            headers,
            query: opts.query,
            body: opts.body,
            timeout: opts.timeout,
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.config.jitter || delay.is_zero() {
            return delay;
        }
        let factor = rand::rng().random_range((1.0 - JITTER)..=(1.0 + JITTER));
        scale(delay, factor)
    }
}

fn check_cancel(cancel: Option<&CancelToken>) -> Result<()> {
    match cancel {
        Some(token) => token.check("rate-limited request"),
        None => Ok(()),
    }
}

/// Lower-cased host of `url`, or `"default"` when it has none.
pub fn domain_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        .unwrap_or_else(|| DEFAULT_DOMAIN.to_string())
}

fn scale(delay: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}
