use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use adapters::control::unix_server::{AdminPolicy, bind_control_socket, run_control_server};
use adapters::http::server::run_http_server;
use adapters::http::state::AppState;
use anyhow::Context;
use application::control_service_impl::ControlService;
use application::defense_service_impl::DefenseAppService;
use application::ipvs_service_impl::IpvsAppService;
use domain::ipvs::table::ServiceTable;
use infrastructure::config::AgentConfig;
use infrastructure::constants::GRACEFUL_SHUTDOWN_TIMEOUT;
use infrastructure::logging::init_logging;
use infrastructure::meminfo::MeminfoProbe;
use infrastructure::metrics::AgentMetrics;
use ports::secondary::metrics_port::MetricsPort;
use tracing::{info, warn};

use crate::cli::Cli;
use crate::shutdown::create_shutdown_token;

/// Run the daemon startup sequence and block until shutdown.
#[allow(clippy::too_many_lines)]
pub async fn run(cli: &Cli) -> anyhow::Result<()> {
    // ── 1. Load config ──────────────────────────────────────────────
    let config = AgentConfig::load(Path::new(&cli.config))
        .with_context(|| format!("failed to load config {}", cli.config))?;

    // ── 2. Initialize logging ───────────────────────────────────────
    let log_level = cli.log_level.unwrap_or(config.agent.log_level);
    let log_format = cli.log_format.unwrap_or(config.agent.log_format);
    init_logging(log_level, log_format)?;

    let _root_span = tracing::span!(
        tracing::Level::INFO,
        "service",
        service.name = "ipvs-sentinel",
        service.version = env!("CARGO_PKG_VERSION"),
    )
    .entered();

    info!(
        config_path = %cli.config,
        log_level = log_level.as_str(),
        log_format = log_format.as_str(),
        "ipvs-sentinel agent starting"
    );

    // ── 3. Metrics and shutdown token ───────────────────────────────
    let metrics = Arc::new(AgentMetrics::new());
    let metrics_port: Arc<dyn MetricsPort> = Arc::clone(&metrics) as Arc<dyn MetricsPort>;
    let cancel_token = create_shutdown_token();

    // ── 4. Service registry ─────────────────────────────────────────
    let ipvs = Arc::new(IpvsAppService::new(
        ServiceTable::default(),
        Arc::clone(&metrics_port),
    ));
    ipvs.set_local_addresses(config.local_addresses()?);

    let services = config.virtual_services()?;
    for (svc, dests) in &services {
        ipvs.add_service(svc)
            .with_context(|| format!("failed to add configured service {}", svc.key))?;
        for dest in dests {
            ipvs.add_dest(&svc.key, dest).with_context(|| {
                format!(
                    "failed to add destination {}:{} to {}",
                    dest.addr, dest.port, svc.key
                )
            })?;
        }
    }
    info!(
        services = ipvs.num_services(),
        conn_tab_size = config.conn_tab_size(),
        "service registry initialized"
    );

    // ── 5. Adaptive defense ─────────────────────────────────────────
    let defense = Arc::new(
        DefenseAppService::new(
            config.defense_tunables(),
            config.conn_timeouts()?,
            Arc::new(MeminfoProbe::new()),
            Arc::clone(&metrics_port),
        )
        .with_tick_interval(config.defense_tick()),
    );
    let defense_handle = tokio::spawn(Arc::clone(&defense).run(cancel_token.clone()));
    info!(
        tick_ms = config.defense_tick().as_millis(),
        "adaptive defense started"
    );

    // ── 6. Control socket ───────────────────────────────────────────
    let control = Arc::new(ControlService::new(
        Arc::clone(&ipvs),
        Arc::clone(&defense),
        Arc::clone(&metrics_port),
        config.conn_tab_size(),
        cancel_token.clone(),
    ));
    let socket_path = PathBuf::from(&config.agent.control_socket);
    let listener = bind_control_socket(&socket_path).with_context(|| {
        format!(
            "failed to bind control socket {}",
            socket_path.display()
        )
    })?;
    let agent_info = config.agent.clone();
    let admin: AdminPolicy = Arc::new(move |uid: u32| agent_info.is_admin(uid));
    let control_handle = tokio::spawn(run_control_server(
        listener,
        socket_path,
        control,
        admin,
        cancel_token.clone(),
    ));

    // ── 7. HTTP observability server ────────────────────────────────
    let ready = Arc::new(AtomicBool::new(false));
    let http_handle = if config.agent.http_enabled {
        let state = Arc::new(AppState::new(
            Arc::clone(&metrics),
            Arc::clone(&ipvs),
            Arc::clone(&defense),
            Arc::clone(&ready),
        ));
        let bind = config.agent.bind_address.clone();
        let port = config.agent.http_port;
        let http_shutdown = cancel_token.clone();
        Some(tokio::spawn(async move {
            if let Err(e) =
                run_http_server(state, &bind, port, http_shutdown.cancelled_owned()).await
            {
                tracing::error!(error = %e, "HTTP server failed");
            }
        }))
    } else {
        info!("HTTP server disabled");
        None
    };

    // ── 8. Ready, wait for cancellation ─────────────────────────────
    ready.store(true, Ordering::Relaxed);
    info!("agent ready, waiting for shutdown signal");
    cancel_token.cancelled().await;

    // ── 9. Ordered shutdown sequence ────────────────────────────────
    info!("shutdown phase 1: closing control socket");
    if tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, control_handle)
        .await
        .is_err()
    {
        warn!("control socket did not stop in time");
    }

    info!("shutdown phase 2: draining HTTP connections");
    if let Some(handle) = http_handle
        && tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, handle)
            .await
            .is_err()
    {
        warn!("HTTP server did not stop in time");
    }

    info!("shutdown phase 3: stopping adaptive defense");
    let _ = tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, defense_handle).await;

    info!(
        services = ipvs.num_services(),
        trash_size = ipvs.trash_size(),
        "agent stopped"
    );
    Ok(())
}
