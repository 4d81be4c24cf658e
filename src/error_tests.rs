//! Tests for error types

#[cfg(test)]
mod tests {
    use super::super::error::{is_retryable_status, PipelineError};

    #[test]
    fn test_http_error_display() {
        let err = PipelineError::Http {
            status: 404,
            url: "https://example.com/x".to_string(),
        };
        assert!(err.to_string().contains("HTTP error"));
        assert!(err.to_string().contains("404"));
        assert!(err.to_string().contains("example.com"));
    }

    #[test]
    fn test_retryable_statuses() {
        for status in [429, 500, 502, 503, 504] {
            assert!(is_retryable_status(status), "{} should retry", status);
        }
        for status in [400, 401, 403, 404, 410, 501] {
            assert!(!is_retryable_status(status), "{} should not retry", status);
        }
    }

    #[test]
    fn test_http_error_classification() {
        let throttled = PipelineError::Http { status: 429, url: String::new() };
        assert!(throttled.is_retryable());

        let missing = PipelineError::Http { status: 404, url: String::new() };
        assert!(!missing.is_retryable());
    }

    #[test]
    fn test_network_error_is_retryable() {
        let err = PipelineError::Network("connection reset".to_string());
        assert!(err.is_retryable());
        assert!(err.to_string().contains("Network error"));
    }

    #[test]
    fn test_non_transport_errors_not_retryable() {
        assert!(!PipelineError::Cache("disk full".into()).is_retryable());
        assert!(!PipelineError::Config("bad".into()).is_retryable());
        assert!(!PipelineError::Cancelled { phase: "fetch".into() }.is_retryable());
    }

    #[test]
    fn test_retries_exhausted_wraps_last() {
        let err = PipelineError::RetriesExhausted {
            url: "https://example.com".to_string(),
            attempts: 4,
            last: Box::new(PipelineError::Http { status: 503, url: "https://example.com".into() }),
        };
        let msg = err.to_string();
        assert!(msg.contains("4 attempts"));
        assert!(msg.contains("503"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_source_error() {
        let err = PipelineError::Source {
            source_name: "snapcounts".to_string(),
            reason: "unreachable".to_string(),
        };
        assert!(err.to_string().contains("snapcounts"));
        assert!(err.to_string().contains("unreachable"));
    }

    #[test]
    fn test_cancelled() {
        let err = PipelineError::Cancelled { phase: "FetchPrimary".to_string() };
        assert!(err.is_cancelled());
        assert!(err.to_string().contains("FetchPrimary"));
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: PipelineError = io.into();
        assert!(matches!(err, PipelineError::Io(_)));
    }

    #[test]
    fn test_from_json_error() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: PipelineError = parse.into();
        assert!(err.to_string().contains("JSON parsing error"));
    }
}
