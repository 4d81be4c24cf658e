//! Unit tests for ingester module

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::cancel::CancelToken;
    use crate::client::mock::{MockReply, MockTransport};
    use crate::client::{RateLimiter, RateLimiterConfig};
    use crate::error::PipelineError;
    use crate::types::RawValue;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn context(mock: &Arc<MockTransport>) -> FetchContext {
        let config = RateLimiterConfig {
            default_delay: Duration::from_millis(100),
            max_retries: 1,
            backoff_factor: 2.0,
            jitter: false,
            user_agent: "test".to_string(),
        };
        FetchContext {
            limiter: Arc::new(RateLimiter::new(mock.clone(), config)),
            cancel: CancelToken::new(),
        }
    }

    #[test]
    fn test_source_params_keys() {
        let team = SourceParams::for_team("game_logs", 2024, "ARI");
        assert_eq!(team.cache_key(), "ARI_2024");
        let season = SourceParams::for_season("snapcounts", 2024);
        assert_eq!(season.cache_key(), "season_2024");
        assert_ne!(team.cache_params(), season.cache_params());

        assert_eq!(SourceParams::from_cache_key("game_logs", "ARI_2024"), Some(team));
        assert_eq!(SourceParams::from_cache_key("snapcounts", "season_2024"), Some(season));
        assert_eq!(SourceParams::from_cache_key("game_logs", "ARI"), None);
        assert_eq!(SourceParams::from_cache_key("game_logs", "_2024"), None);
    }

    #[test]
    fn test_url_template() {
        let source = JsonEndpointSource::new("game_logs", "https://stats.example.com/{season}/logs/{team}.json");
        let url = source.url_for(&SourceParams::for_team("game_logs", 2024, "ARI"));
        assert_eq!(url, "https://stats.example.com/2024/logs/ARI.json");
        assert_eq!(source.name(), "game_logs");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_bare_array() {
        let mock = Arc::new(MockTransport::new());
        let url = "https://stats.example.com/2024/ARI";
        mock.push(
            url,
            MockReply::Json(json!([
                {"Season": 2024, "Week": 1, "Player": "X", "Team": "ARI", "Rush_Yards": 55},
                {"Season": 2024, "Week": 1, "Player": "Y", "Team": "ARI", "Snapcount": ""}
            ])),
        );
        let source = JsonEndpointSource::new("game_logs", "https://stats.example.com/{season}/{team}");

        let rows = source
            .fetch_raw(&SourceParams::for_team("game_logs", 2024, "ARI"), &context(&mock))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].stats.get("Rush_Yards"), Some(&RawValue::Int(55)));

        let sent = mock.requests();
        assert_eq!(sent[0].headers.iter().filter(|(k, _)| k == "Accept").count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_wrapped_rows() {
        let mock = Arc::new(MockTransport::new());
        let url = "https://stats.example.com/snaps/2024";
        mock.push(url, MockReply::Json(json!({"rows": [{"Player": "X", "Snapcount": 40}]})));
        let source = JsonEndpointSource::new("snapcounts", "https://stats.example.com/snaps/{season}");

        let rows = source
            .fetch_raw(&SourceParams::for_season("snapcounts", 2024), &context(&mock))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].player.as_deref(), Some("X"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_keeps_good_rows_next_to_dirty_ones() {
        let mock = Arc::new(MockTransport::new());
        let url = "https://stats.example.com/2024/ARI";
        mock.push(
            url,
            MockReply::Json(json!([
                {"Season": 2024, "Week": 1, "Player": "X", "Team": "ARI", "Rush_Yards": 55},
                {"Season": 2024, "Week": 1, "Player": "Y", "Team": "ARI", "Links": {"href": "/y"}},
                {"Season": 2024, "Week": 1, "Player": 12, "Team": "ARI"},
                "not a row"
            ])),
        );
        let source = JsonEndpointSource::new("game_logs", "https://stats.example.com/{season}/{team}");

        let rows = source
            .fetch_raw(&SourceParams::for_team("game_logs", 2024, "ARI"), &context(&mock))
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].stats.get("Rush_Yards"), Some(&RawValue::Int(55)));
        assert!(matches!(rows[1].stats.get("Links"), Some(RawValue::Other(_))));
        assert_eq!(rows[2].player.as_deref(), Some("12"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_propagates_http_errors() {
        let mock = Arc::new(MockTransport::new());
        let url = "https://stats.example.com/2024/XXX";
        mock.set_fallback(url, MockReply::Status(404));
        let source = JsonEndpointSource::new("game_logs", "https://stats.example.com/{season}/{team}");

        let err = source
            .fetch_raw(&SourceParams::for_team("game_logs", 2024, "XXX"), &context(&mock))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Http { status: 404, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_rejects_non_row_payload() {
        let mock = Arc::new(MockTransport::new());
        let url = "https://stats.example.com/2024/ARI";
        mock.push(url, MockReply::Json(json!({"error": "maintenance"})));
        let source = JsonEndpointSource::new("game_logs", "https://stats.example.com/{season}/{team}");

        let err = source
            .fetch_raw(&SourceParams::for_team("game_logs", 2024, "ARI"), &context(&mock))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Json(_)));
    }

    #[tokio::test]
    async fn test_fetch_rejects_invalid_url() {
        let mock = Arc::new(MockTransport::new());
        let source = JsonEndpointSource::new("game_logs", "stats/{season}/{team}");

        let err = source
            .fetch_raw(&SourceParams::for_team("game_logs", 2024, "ARI"), &context(&mock))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidUrl(_)));
        assert!(mock.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_observes_cancellation() {
        let mock = Arc::new(MockTransport::new());
        let source = JsonEndpointSource::new("game_logs", "https://stats.example.com/{season}/{team}");
        let ctx = context(&mock);
        ctx.cancel.cancel();

        let err = source
            .fetch_raw(&SourceParams::for_team("game_logs", 2024, "ARI"), &ctx)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(mock.requests().is_empty());
    }

    #[tokio::test]
    async fn test_mock_fetcher() {
        let mut fetcher = MockSourceFetcher::new();
        fetcher
            .expect_fetch_raw()
            .withf(|params, _| params.team.as_deref() == Some("ARI"))
            .times(1)
            .returning(|_, _| Ok(vec![RawSourceRow::new(2024, 1, "X", "ARI")]));

        let mock = Arc::new(MockTransport::new());
        let rows = fetcher
            .fetch_raw(&SourceParams::for_team("game_logs", 2024, "ARI"), &context(&mock))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }
}
