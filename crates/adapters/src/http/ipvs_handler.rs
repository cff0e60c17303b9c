use std::net::Ipv4Addr;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use domain::common::entity::Protocol;
use domain::defense::entity::DefenseSnapshot;
use domain::defense::timeouts::UserTimeouts;
use domain::ipvs::entity::{DestView, ServiceKey, ServiceView};
use domain::ipvs::stats::StatsSnapshot;
use serde::Serialize;

use super::error::ApiError;
use super::state::AppState;

// ── Response DTOs ─────────────────────────────────────────────────

#[derive(Serialize)]
pub struct AgentStatusResponse {
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub services: usize,
    pub trash_size: usize,
    pub schedulers: Vec<String>,
    pub stats: StatsSnapshot,
}

#[derive(Serialize)]
pub struct ServiceResponse {
    pub protocol: Protocol,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fwmark: Option<u32>,
    pub scheduler: String,
    pub persistent: bool,
    pub timeout: u32,
    pub netmask: Ipv4Addr,
    pub num_dests: usize,
    pub stats: StatsSnapshot,
    pub destinations: Vec<DestView>,
}

impl ServiceResponse {
    fn from_view(v: ServiceView, destinations: Vec<DestView>) -> Self {
        let (addr, port, fwmark) = match v.key {
            ServiceKey::Mark { fwmark, .. } => (None, None, Some(fwmark)),
            ServiceKey::Tuple { .. } => (Some(v.key.addr()), Some(v.key.port()), None),
        };
        Self {
            protocol: v.key.protocol(),
            addr,
            port,
            fwmark,
            scheduler: v.scheduler,
            persistent: v.flags.is_persistent(),
            timeout: v.timeout,
            netmask: v.netmask,
            num_dests: v.num_dests,
            stats: v.stats,
            destinations,
        }
    }
}

#[derive(Serialize)]
pub struct DefenseResponse {
    #[serde(flatten)]
    pub snapshot: DefenseSnapshot,
    pub timeouts: UserTimeouts,
}

fn parse_protocol(s: &str) -> Result<Protocol, ApiError> {
    match s.to_ascii_lowercase().as_str() {
        "tcp" => Ok(Protocol::Tcp),
        "udp" => Ok(Protocol::Udp),
        _ => Err(ApiError::BadRequest {
            code: "INVALID_PROTOCOL",
            message: format!("unknown protocol '{s}', expected tcp or udp"),
        }),
    }
}

fn describe(state: &AppState, view: ServiceView) -> Result<ServiceResponse, ApiError> {
    let dests = state.ipvs.dests(&view.key, usize::MAX)?;
    Ok(ServiceResponse::from_view(view, dests))
}

// ── Handlers ──────────────────────────────────────────────────────

pub async fn agent_status(State(state): State<Arc<AppState>>) -> Json<AgentStatusResponse> {
    Json(AgentStatusResponse {
        version: state.version,
        uptime_seconds: state.start_time.elapsed().as_secs(),
        services: state.ipvs.num_services(),
        trash_size: state.ipvs.trash_size(),
        schedulers: state.ipvs.scheduler_names(),
        stats: state.ipvs.global_stats(),
    })
}

pub async fn list_services(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ServiceResponse>>, ApiError> {
    let views = state.ipvs.services(usize::MAX);
    let mut out = Vec::with_capacity(views.len());
    for view in views {
        match describe(&state, view) {
            Ok(svc) => out.push(svc),
            // Deleted between the two reads.
            Err(ApiError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(Json(out))
}

pub async fn get_service(
    State(state): State<Arc<AppState>>,
    Path((protocol, addr, port)): Path<(String, Ipv4Addr, u16)>,
) -> Result<Json<ServiceResponse>, ApiError> {
    let key = ServiceKey::tuple(parse_protocol(&protocol)?, addr, port);
    let view = state.ipvs.get_service(&key)?;
    Ok(Json(describe(&state, view)?))
}

pub async fn get_mark_service(
    State(state): State<Arc<AppState>>,
    Path((protocol, fwmark)): Path<(String, u32)>,
) -> Result<Json<ServiceResponse>, ApiError> {
    if fwmark == 0 {
        return Err(ApiError::BadRequest {
            code: "INVALID_FWMARK",
            message: "firewall mark must be nonzero".to_string(),
        });
    }
    let key = ServiceKey::mark(parse_protocol(&protocol)?, fwmark);
    let view = state.ipvs.get_service(&key)?;
    Ok(Json(describe(&state, view)?))
}

pub async fn defense_status(State(state): State<Arc<AppState>>) -> Json<DefenseResponse> {
    Json(DefenseResponse {
        snapshot: state.defense.snapshot(),
        timeouts: state.defense.user_timeouts(),
    })
}
