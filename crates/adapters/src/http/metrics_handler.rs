use std::sync::Arc;

use axum::extract::State;
use axum::http::header;

use super::state::AppState;

/// Content-Type for `OpenMetrics` text exposition format.
const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Serves Prometheus metrics in `OpenMetrics` text format.
pub async fn metrics(
    State(state): State<Arc<AppState>>,
) -> ([(header::HeaderName, &'static str); 1], String) {
    let body = state.metrics.encode();
    ([(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)], body)
}

#[cfg(test)]
mod tests {
    use super::super::state::test_support::test_state;
    use super::*;

    #[test]
    fn content_type_is_valid() {
        assert!(OPENMETRICS_CONTENT_TYPE.starts_with("application/openmetrics-text"));
        assert!(OPENMETRICS_CONTENT_TYPE.contains("version=1.0.0"));
    }

    #[tokio::test]
    async fn body_reflects_registry_gauges() {
        let state = test_state(true);
        state.ipvs.flush().unwrap();
        let (_, body) = metrics(State(state)).await;
        assert!(body.contains("ipvs_sentinel_services 0"));
        assert!(body.contains("# EOF"));
    }
}
