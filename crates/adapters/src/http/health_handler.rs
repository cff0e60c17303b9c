use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;

use super::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    /// Always `"ok"`.
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    /// `"ready"` or `"not_ready"`.
    pub status: &'static str,
    pub services: usize,
}

/// Liveness probe: 200 whenever the process is serving.
pub async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Readiness probe: 200 once startup completed, 503 before.
pub async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let ready = state.ready.load(Ordering::Relaxed);
    let (code, status) = if ready {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not_ready")
    };
    (
        code,
        Json(ReadyResponse {
            status,
            services: state.ipvs.num_services(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::super::state::test_support::test_state;
    use super::*;

    #[tokio::test]
    async fn healthz_always_returns_ok() {
        let Json(resp) = healthz().await;
        assert_eq!(resp.status, "ok");
    }

    #[tokio::test]
    async fn readyz_returns_ready_after_startup() {
        let resp = readyz(State(test_state(true))).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_returns_unavailable_during_startup() {
        let resp = readyz(State(test_state(false))).await.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
