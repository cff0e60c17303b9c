use std::sync::Arc;

use axum::Router;
use axum::routing::get;

use super::health_handler::{healthz, readyz};
use super::ipvs_handler::{
    agent_status, defense_status, get_mark_service, get_service, list_services,
};
use super::metrics_handler::metrics;
use super::state::AppState;

/// Build the observability router.
///
/// Routes are read-only; every mutation goes through the control socket.
/// 1. **Probes**: `/healthz`, `/readyz`
/// 2. **Metrics**: `/metrics` in OpenMetrics text format
/// 3. **API**: `/api/v1/*` JSON views of the service table and defense state
pub fn build_router(state: Arc<AppState>) -> Router {
    let probe_routes = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics));

    let api_routes = Router::new()
        .route("/api/v1/status", get(agent_status))
        .route("/api/v1/services", get(list_services))
        .route(
            "/api/v1/services/{protocol}/{addr}/{port}",
            get(get_service),
        )
        .route(
            "/api/v1/services/{protocol}/fwmark/{fwmark}",
            get(get_mark_service),
        )
        .route("/api/v1/defense", get(defense_status));

    probe_routes.merge(api_routes).with_state(state)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use domain::common::entity::Protocol;
    use domain::ipvs::entity::{DestConfig, ServiceConfig, ServiceKey};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::super::state::test_support::test_state;
    use super::*;

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = router
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn web_key() -> ServiceKey {
        ServiceKey::tuple(Protocol::Tcp, Ipv4Addr::new(10, 0, 0, 1), 80)
    }

    fn populated_state() -> Arc<AppState> {
        let state = test_state(true);
        state
            .ipvs
            .add_service(&ServiceConfig::new(web_key()).with_scheduler("rr"))
            .unwrap();
        state
            .ipvs
            .add_dest(&web_key(), &DestConfig::new(Ipv4Addr::new(192, 168, 1, 10), 8080))
            .unwrap();
        state
            .ipvs
            .add_service(
                &ServiceConfig::new(ServiceKey::mark(Protocol::Udp, 7)).with_scheduler("rr"),
            )
            .unwrap();
        state
    }

    #[tokio::test]
    async fn status_reports_table_size() {
        let (status, body) = get_json(build_router(populated_state()), "/api/v1/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["services"], 2);
        assert_eq!(body["trash_size"], 0);
        assert!(
            body["schedulers"]
                .as_array()
                .unwrap()
                .iter()
                .any(|s| s == "rr")
        );
    }

    #[tokio::test]
    async fn list_services_includes_destinations() {
        let (status, body) = get_json(build_router(populated_state()), "/api/v1/services").await;
        assert_eq!(status, StatusCode::OK);
        let services = body.as_array().unwrap();
        assert_eq!(services.len(), 2);

        let web = services
            .iter()
            .find(|s| s["port"] == 80)
            .expect("tuple service listed");
        assert_eq!(web["protocol"], "tcp");
        assert_eq!(web["addr"], "10.0.0.1");
        assert_eq!(web["num_dests"], 1);
        assert_eq!(web["destinations"][0]["addr"], "192.168.1.10");
        assert_eq!(web["destinations"][0]["port"], 8080);
        assert!(web.get("fwmark").is_none());

        let marked = services
            .iter()
            .find(|s| s["fwmark"] == 7)
            .expect("mark service listed");
        assert!(marked.get("addr").is_none());
    }

    #[tokio::test]
    async fn get_service_by_tuple() {
        let (status, body) = get_json(
            build_router(populated_state()),
            "/api/v1/services/tcp/10.0.0.1/80",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["scheduler"], "rr");
        assert_eq!(body["persistent"], false);
    }

    #[tokio::test]
    async fn get_service_by_mark() {
        let (status, body) = get_json(
            build_router(populated_state()),
            "/api/v1/services/udp/fwmark/7",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["protocol"], "udp");
        assert_eq!(body["fwmark"], 7);
    }

    #[tokio::test]
    async fn missing_service_is_404() {
        let (status, body) = get_json(
            build_router(populated_state()),
            "/api/v1/services/tcp/10.0.0.9/80",
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn unknown_protocol_is_400() {
        let (status, body) = get_json(
            build_router(populated_state()),
            "/api/v1/services/sctp/10.0.0.1/80",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_PROTOCOL");
    }

    #[tokio::test]
    async fn zero_fwmark_is_400() {
        let (status, _) = get_json(
            build_router(populated_state()),
            "/api/v1/services/tcp/fwmark/0",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn defense_view_has_tunables_and_timeouts() {
        let (status, body) = get_json(build_router(test_state(true)), "/api/v1/defense").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.get("tunables").is_some());
        assert!(body.get("effective").is_some());
        assert!(body.get("timeouts").is_some());
    }

    #[tokio::test]
    async fn probes_are_routed() {
        let router = build_router(test_state(false));
        let (status, _) = get_json(router.clone(), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = get_json(router, "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let (status, _) = get_json(build_router(test_state(true)), "/api/v1/firewall").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
