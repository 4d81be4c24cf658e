//! Tests for client module

#[cfg(test)]
mod tests {
    use super::super::mock::{MockReply, MockTransport};
    use super::super::{HttpMethod, RateLimiter, RateLimiterConfig, RequestOptions};
    use crate::cancel::CancelToken;
    use crate::error::PipelineError;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    const URL: &str = "https://stats.example.com/logs/ARI/2024";
    const DOMAIN: &str = "stats.example.com";

    fn config(max_retries: u32) -> RateLimiterConfig {
        RateLimiterConfig {
            default_delay: Duration::from_secs(1),
            max_retries,
            backoff_factor: 2.0,
            jitter: false,
            user_agent: "season-extractor-test".to_string(),
        }
    }

    fn limiter(mock: &Arc<MockTransport>, max_retries: u32) -> RateLimiter {
        RateLimiter::new(mock.clone(), config(max_retries))
    }

    fn gaps(times: &[Instant]) -> Vec<Duration> {
        times.windows(2).map(|w| w[1] - w[0]).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_domain_spacing_respects_current_delay() {
        let mock = Arc::new(MockTransport::new());
        let limiter = limiter(&mock, 3);

        let mut delays_at_send = Vec::new();
        for _ in 0..6 {
            delays_at_send.push(limiter.current_delay(DOMAIN));
            limiter.make_request(URL, HttpMethod::Get, RequestOptions::default()).await.unwrap();
        }

        let times = mock.request_times(URL);
        assert_eq!(times.len(), 6);
        // the timer wheel has millisecond resolution
        let resolution = Duration::from_millis(1);
        for (i, gap) in gaps(&times).iter().enumerate() {
            assert!(
                *gap + resolution >= delays_at_send[i + 1],
                "gap {:?} shorter than delay {:?}",
                gap,
                delays_at_send[i + 1]
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_same_domain_requests_queue() {
        let mock = Arc::new(MockTransport::new());
        let limiter = Arc::new(limiter(&mock, 0));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move {
                    limiter.make_request(URL, HttpMethod::Get, RequestOptions::default()).await
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let mut times = mock.request_times(URL);
        times.sort();
        // never closer than the floor of half the base delay
        for gap in gaps(&times) {
            assert!(gap >= Duration::from_millis(500), "burst gap {:?}", gap);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_domains_do_not_serialize() {
        let mock = Arc::new(MockTransport::new());
        let limiter = Arc::new(limiter(&mock, 0));
        let urls = ["https://a.example.com/x", "https://b.example.com/x", "https://c.example.com/x"];

        let started = Instant::now();
        let handles: Vec<_> = urls
            .iter()
            .flat_map(|url| std::iter::repeat(*url).take(3))
            .map(|url| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move {
                    limiter.make_request(url, HttpMethod::Get, RequestOptions::default()).await
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }

        // three domains in parallel need about two delays, not eight
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
        assert_eq!(limiter.stats().domain_request_counts.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_429_retries_with_growing_backoff() {
        let mock = Arc::new(MockTransport::new());
        mock.push(URL, MockReply::Status(429));
        mock.push(URL, MockReply::Status(429));
        mock.push(URL, MockReply::Json(serde_json::json!([{"Player": "X"}])));
        let limiter = limiter(&mock, 3);

        let resp = limiter.make_request(URL, HttpMethod::Get, RequestOptions::default()).await.unwrap();
        assert_eq!(resp.status, 200);

        let gaps = gaps(&mock.request_times(URL));
        assert_eq!(gaps.len(), 2);
        assert!(gaps[1] > gaps[0], "backoff did not grow: {:?}", gaps);

        let stats = limiter.stats();
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.rate_limit_hits, 2);
        assert_eq!(stats.successful_requests, 1);
        assert_eq!(stats.total_requests, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_delay_is_monotonic_in_attempt() {
        let mock = Arc::new(MockTransport::new());
        let limiter = limiter(&mock, 3);
        let d0 = limiter.retry_delay(DOMAIN, 0);
        let d1 = limiter.retry_delay(DOMAIN, 1);
        let d2 = limiter.retry_delay(DOMAIN, 2);
        assert_eq!(d0, Duration::from_secs(1));
        assert!(d1 > d0 && d2 > d1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_404_is_not_retried() {
        let mock = Arc::new(MockTransport::new());
        mock.set_fallback(URL, MockReply::Status(404));
        let limiter = limiter(&mock, 3);

        let err = limiter
            .make_request(URL, HttpMethod::Get, RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Http { status: 404, .. }));
        assert_eq!(mock.request_count(URL), 1);

        let stats = limiter.stats();
        assert_eq!(stats.retries, 0);
        assert_eq!(stats.failed_requests, 1);
        // a client error does not slow the domain down
        assert_eq!(limiter.current_delay(DOMAIN), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_server_error_grows_delay() {
        let mock = Arc::new(MockTransport::new());
        mock.set_fallback(URL, MockReply::Status(501));
        let limiter = limiter(&mock, 3);

        let err = limiter
            .make_request(URL, HttpMethod::Get, RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Http { status: 501, .. }));
        assert_eq!(mock.request_count(URL), 1);
        assert_eq!(limiter.stats().retries, 0);
        assert_eq!(limiter.current_delay(DOMAIN), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_surface_last_error() {
        let mock = Arc::new(MockTransport::new());
        mock.set_fallback(URL, MockReply::Status(503));
        let limiter = limiter(&mock, 2);

        let err = limiter
            .make_request(URL, HttpMethod::Get, RequestOptions::default())
            .await
            .unwrap_err();
        match err {
            PipelineError::RetriesExhausted { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, PipelineError::Http { status: 503, .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(mock.request_count(URL), 3);
        assert!(limiter.current_delay(DOMAIN) > Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_error_is_retried() {
        let mock = Arc::new(MockTransport::new());
        mock.push(URL, MockReply::NetworkError("connection reset".into()));
        let limiter = limiter(&mock, 3);

        limiter.make_request(URL, HttpMethod::Get, RequestOptions::default()).await.unwrap();
        assert_eq!(mock.request_count(URL), 2);
        assert_eq!(limiter.stats().retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_shrinks_and_grows_within_bounds() {
        let mock = Arc::new(MockTransport::new());
        let limiter = limiter(&mock, 0);

        for _ in 0..30 {
            limiter.make_request(URL, HttpMethod::Get, RequestOptions::default()).await.unwrap();
        }
        assert_eq!(limiter.current_delay(DOMAIN), Duration::from_millis(500));

        mock.set_fallback(URL, MockReply::Status(500));
        for _ in 0..12 {
            let _ = limiter.make_request(URL, HttpMethod::Get, RequestOptions::default()).await;
        }
        assert_eq!(limiter.current_delay(DOMAIN), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_response_does_not_shrink_delay() {
        let mock = Arc::new(MockTransport::new().with_latency(Duration::from_secs(2)));
        let limiter = limiter(&mock, 0);

        limiter.make_request(URL, HttpMethod::Get, RequestOptions::default()).await.unwrap();
        assert_eq!(limiter.current_delay(DOMAIN), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_domain_delay() {
        let mock = Arc::new(MockTransport::new());
        let limiter = limiter(&mock, 0);
        limiter.set_domain_delay(DOMAIN, Duration::from_secs(3));

        limiter.make_request(URL, HttpMethod::Get, RequestOptions::default()).await.unwrap();
        limiter.make_request(URL, HttpMethod::Get, RequestOptions::default()).await.unwrap();

        let gaps = gaps(&mock.request_times(URL));
        assert!(gaps[0] >= Duration::from_millis(2850), "gap {:?}", gaps[0]);
        // the floor follows the custom base delay
        assert!(limiter.current_delay(DOMAIN) >= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_request() {
        let mock = Arc::new(MockTransport::new());
        let limiter = limiter(&mock, 3);
        let cancel = CancelToken::new();
        cancel.cancel();

        let opts = RequestOptions { cancel: Some(cancel), ..Default::default() };
        let err = limiter.make_request(URL, HttpMethod::Get, opts).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(mock.request_count(URL), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_rate_limit_wait() {
        let mock = Arc::new(MockTransport::new());
        let limiter = limiter(&mock, 3);
        limiter.make_request(URL, HttpMethod::Get, RequestOptions::default()).await.unwrap();

        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let opts = RequestOptions { cancel: Some(cancel), ..Default::default() };
        let err = limiter.make_request(URL, HttpMethod::Get, opts).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(mock.request_count(URL), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let mock = Arc::new(MockTransport::new());
        mock.set_fallback(URL, MockReply::Status(503));
        let limiter = limiter(&mock, 5);

        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let opts = RequestOptions { cancel: Some(cancel), ..Default::default() };
        let err = limiter.make_request(URL, HttpMethod::Get, opts).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(mock.request_count(URL), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_agent_attached() {
        let mock = Arc::new(MockTransport::new());
        let limiter = limiter(&mock, 0);
        limiter.make_request(URL, HttpMethod::Get, RequestOptions::default()).await.unwrap();

        let opts = RequestOptions {
            headers: vec![("user-agent".to_string(), "custom".to_string())],
            ..Default::default()
        };
        limiter.make_request(URL, HttpMethod::Get, opts).await.unwrap();

        let requests = mock.requests();
        let agent = |i: usize| {
            requests[i]
                .headers
                .iter()
                .filter(|(k, _)| k.eq_ignore_ascii_case("user-agent"))
                .map(|(_, v)| v.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(agent(0), vec!["season-extractor-test".to_string()]);
        assert_eq!(agent(1), vec!["custom".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_and_reset() {
        let mock = Arc::new(MockTransport::new());
        mock.push(URL, MockReply::Status(502));
        let limiter = limiter(&mock, 1);

        limiter.make_request(URL, HttpMethod::Get, RequestOptions::default()).await.unwrap();
        let stats = limiter.stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.successful_requests, 1);
        assert_eq!(stats.success_rate_percent, 50.0);
        assert!(stats.total_delay_time > 0.0);
        assert_eq!(stats.domain_error_counts.get(DOMAIN), Some(&1));

        limiter.reset_stats();
        let stats = limiter.stats();
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.domain_request_counts.get(DOMAIN), Some(&0));
        assert!(stats.domain_delays.contains_key(DOMAIN));
    }
}
