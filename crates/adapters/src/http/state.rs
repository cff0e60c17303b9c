use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use application::defense_service_impl::DefenseAppService;
use application::ipvs_service_impl::IpvsAppService;
use infrastructure::metrics::AgentMetrics;

/// Shared state for the observability server.
///
/// Passed to Axum handlers via `State(Arc<AppState>)`.
pub struct AppState {
    pub metrics: Arc<AgentMetrics>,
    pub ipvs: Arc<IpvsAppService>,
    pub defense: Arc<DefenseAppService>,
    /// Set once configured services are applied and the control socket is up.
    pub ready: Arc<AtomicBool>,
    pub start_time: Instant,
    pub version: &'static str,
}

impl AppState {
    pub fn new(
        metrics: Arc<AgentMetrics>,
        ipvs: Arc<IpvsAppService>,
        defense: Arc<DefenseAppService>,
        ready: Arc<AtomicBool>,
    ) -> Self {
        Self {
            metrics,
            ipvs,
            defense,
            ready,
            start_time: Instant::now(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}
