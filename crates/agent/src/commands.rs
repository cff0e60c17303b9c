use std::net::Ipv4Addr;

use anyhow::{Result, bail};
use domain::common::entity::Protocol;
use domain::ipvs::entity::{ForwardingMethod, ServiceFlags};
use ipvs_common::sockopt::version_triplet;
use ipvs_common::user::{
    DAEMON_STATE_BACKUP, DAEMON_STATE_MASTER, DaemonUser, DefenseEntry, DefenseUser, DestEntry,
    DestUser, EFFECTIVE_DROP_ENTRY, EFFECTIVE_DROP_PACKET, EFFECTIVE_SECURE_TCP, ServiceEntry,
    ServiceUser, StatsUser, TimeoutsUser, UNCHANGED, decode_name, encode_name,
};
use serde::Serialize;

use crate::cli::{
    DaemonRole, DefenseSetArgs, DestArgs, Forwarding, MarkProtocol, OutputFormat, ServiceArgs,
    ServiceSelector,
};
use crate::ctl_client::ControlClient;

// ── Selectors ───────────────────────────────────────────────────────────

impl MarkProtocol {
    fn number(self) -> u16 {
        match self {
            Self::Tcp => Protocol::Tcp.number(),
            Self::Udp => Protocol::Udp.number(),
        }
    }
}

impl Forwarding {
    fn conn_flags(self) -> u32 {
        match self {
            Self::Masq => ForwardingMethod::Masquerade.bits(),
            Self::Tunnel => ForwardingMethod::Tunnel.bits(),
            Self::Route => ForwardingMethod::DirectRoute.bits(),
        }
    }
}

/// Encode a selector. An empty selector is only valid for `zero`.
fn selector_user(sel: &ServiceSelector, mark_protocol: MarkProtocol) -> Result<ServiceUser> {
    let base = ServiceUser::default();
    if let Some(ep) = sel.tcp {
        return Ok(ServiceUser {
            protocol: Protocol::Tcp.number(),
            addr: *ep.ip(),
            port: ep.port(),
            ..base
        });
    }
    if let Some(ep) = sel.udp {
        return Ok(ServiceUser {
            protocol: Protocol::Udp.number(),
            addr: *ep.ip(),
            port: ep.port(),
            ..base
        });
    }
    if let Some(fwmark) = sel.fwmark {
        if fwmark == 0 {
            bail!("firewall mark must be nonzero");
        }
        return Ok(ServiceUser {
            protocol: mark_protocol.number(),
            fwmark,
            ..base
        });
    }
    bail!("one of --tcp-service, --udp-service or --fwmark-service is required")
}

fn service_user(args: &ServiceArgs) -> Result<ServiceUser> {
    let selector = selector_user(&args.selector, args.mark_protocol)?;
    let (flags, timeout) = match args.persistent {
        Some(secs) => (ServiceFlags::PERSISTENT, secs),
        None => (0, 0),
    };
    Ok(ServiceUser {
        sched_name: encode_name(&args.scheduler)?,
        flags,
        timeout,
        netmask: args.netmask,
        ..selector
    })
}

fn dest_user(args: &DestArgs) -> DestUser {
    DestUser {
        addr: *args.real_server.ip(),
        port: args.real_server.port(),
        conn_flags: args.forwarding.conn_flags(),
        weight: args.weight,
    }
}

// ── Display rows ────────────────────────────────────────────────────────

#[derive(Serialize)]
struct StatsRow {
    conns: u32,
    inpkts: u32,
    outpkts: u32,
    inbytes: u64,
    outbytes: u64,
}

impl From<&StatsUser> for StatsRow {
    fn from(s: &StatsUser) -> Self {
        Self {
            conns: s.conns,
            inpkts: s.inpkts,
            outpkts: s.outpkts,
            inbytes: s.inbytes,
            outbytes: s.outbytes,
        }
    }
}

#[derive(Serialize)]
struct DestRow {
    addr: Ipv4Addr,
    port: u16,
    forwarding: &'static str,
    weight: i32,
    active_conns: u32,
    inactive_conns: u32,
    stats: StatsRow,
}

impl From<&DestEntry> for DestRow {
    fn from(d: &DestEntry) -> Self {
        Self {
            addr: d.addr,
            port: d.port,
            forwarding: ForwardingMethod::from_conn_flags(d.conn_flags)
                .map_or("?", ForwardingMethod::as_str),
            weight: d.weight,
            active_conns: d.active_conns,
            inactive_conns: d.inactive_conns,
            stats: StatsRow::from(&d.stats),
        }
    }
}

#[derive(Serialize)]
struct ServiceRow {
    protocol: String,
    /// `ADDR:PORT` or `FWM <mark>`.
    service: String,
    scheduler: String,
    persistent: Option<u32>,
    netmask: Ipv4Addr,
    num_dests: u32,
    stats: StatsRow,
    #[serde(skip_serializing_if = "Option::is_none")]
    destinations: Option<Vec<DestRow>>,
}

impl ServiceRow {
    fn new(e: &ServiceEntry, dests: Option<&[DestEntry]>) -> Self {
        let svc = &e.service;
        let protocol = Protocol::from_number(svc.protocol)
            .map_or_else(|| svc.protocol.to_string(), |p| p.as_str().to_string());
        let service = if svc.fwmark == 0 {
            format!("{}:{}", svc.addr, svc.port)
        } else {
            format!("FWM {}", svc.fwmark)
        };
        let persistent = (svc.flags & ServiceFlags::PERSISTENT != 0).then_some(svc.timeout);
        Self {
            protocol,
            service,
            scheduler: decode_name(&svc.sched_name).unwrap_or_default(),
            persistent,
            netmask: svc.netmask,
            num_dests: e.num_dests,
            stats: StatsRow::from(&e.stats),
            destinations: dests.map(|d| d.iter().map(DestRow::from).collect()),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ── Version / info ──────────────────────────────────────────────────────

pub async fn cmd_version(client: Option<&mut ControlClient>, output: OutputFormat) -> Result<()> {
    let daemon = match client {
        Some(c) => match c.version().await {
            Ok(v) => Some(v),
            Err(e) => {
                eprintln!("daemon version unavailable: {e:#}");
                None
            }
        },
        None => None,
    };

    if output == OutputFormat::Json {
        return print_json(&serde_json::json!({
            "client": env!("CARGO_PKG_VERSION"),
            "daemon": daemon,
        }));
    }

    println!("ipvs-agent {}", env!("CARGO_PKG_VERSION"));
    if let Some(d) = daemon {
        println!("{d}");
    }
    Ok(())
}

pub async fn cmd_info(client: &mut ControlClient, output: OutputFormat) -> Result<()> {
    let info = client.info().await?;

    if output == OutputFormat::Json {
        return print_json(&serde_json::json!({
            "version": version_triplet(info.version),
            "conn_tab_size": info.conn_tab_size,
            "num_services": info.num_services,
        }));
    }

    println!("IP Virtual Server version {}", version_triplet(info.version));
    println!("  Connection table size: {}", info.conn_tab_size);
    println!("  Services:              {}", info.num_services);
    Ok(())
}

// ── Services ────────────────────────────────────────────────────────────

pub async fn cmd_list(client: &mut ControlClient, with_dests: bool, output: OutputFormat) -> Result<()> {
    let services = client.services().await?;
    let mut rows = Vec::with_capacity(services.len());
    for entry in &services {
        let dests = if with_dests {
            Some(client.dests(entry).await?)
        } else {
            None
        };
        rows.push(ServiceRow::new(entry, dests.as_deref()));
    }

    if output == OutputFormat::Json {
        return print_json(&rows);
    }

    if rows.is_empty() {
        println!("No virtual services configured.");
        return Ok(());
    }

    println!(
        "{:<5} {:<22} {:<8} {:>10} {:>6} {:>10}",
        "PROT", "SERVICE", "SCHED", "PERSIST", "DESTS", "CONNS"
    );
    for row in &rows {
        let persist = row
            .persistent
            .map_or_else(|| "-".to_string(), |t| format!("{t}s"));
        println!(
            "{:<5} {:<22} {:<8} {:>10} {:>6} {:>10}",
            row.protocol, row.service, row.scheduler, persist, row.num_dests, row.stats.conns
        );
        for d in row.destinations.iter().flatten() {
            println!(
                "  -> {:<22} {:<8} {:>6} {:>8} {:>8}",
                format!("{}:{}", d.addr, d.port),
                d.forwarding,
                d.weight,
                d.active_conns,
                d.inactive_conns
            );
        }
    }
    println!("\n{} service(s) total.", rows.len());
    Ok(())
}

pub async fn cmd_service_add(client: &mut ControlClient, args: &ServiceArgs) -> Result<()> {
    let svc = service_user(args)?;
    client.add_service(&svc).await?;
    println!("Service added: {}", ServiceRow::new(&entry_of(svc), None).service);
    Ok(())
}

pub async fn cmd_service_edit(client: &mut ControlClient, args: &ServiceArgs) -> Result<()> {
    let svc = service_user(args)?;
    client.edit_service(&svc).await?;
    println!("Service updated: {}", ServiceRow::new(&entry_of(svc), None).service);
    Ok(())
}

pub async fn cmd_service_del(
    client: &mut ControlClient,
    selector: &ServiceSelector,
    mark_protocol: MarkProtocol,
) -> Result<()> {
    let svc = selector_user(selector, mark_protocol)?;
    client.del_service(&svc).await?;
    println!("Service deleted: {}", ServiceRow::new(&entry_of(svc), None).service);
    Ok(())
}

fn entry_of(service: ServiceUser) -> ServiceEntry {
    ServiceEntry {
        service,
        ..ServiceEntry::default()
    }
}

// ── Destinations ────────────────────────────────────────────────────────

pub async fn cmd_dest_add(client: &mut ControlClient, args: &DestArgs) -> Result<()> {
    let svc = selector_user(&args.selector, args.mark_protocol)?;
    client.add_dest(&svc, &dest_user(args)).await?;
    println!("Destination added: {}", args.real_server);
    Ok(())
}

pub async fn cmd_dest_edit(client: &mut ControlClient, args: &DestArgs) -> Result<()> {
    let svc = selector_user(&args.selector, args.mark_protocol)?;
    client.edit_dest(&svc, &dest_user(args)).await?;
    println!(
        "Destination updated: {} (weight={})",
        args.real_server, args.weight
    );
    Ok(())
}

pub async fn cmd_dest_del(
    client: &mut ControlClient,
    selector: &ServiceSelector,
    mark_protocol: MarkProtocol,
    real_server: std::net::SocketAddrV4,
) -> Result<()> {
    let svc = selector_user(selector, mark_protocol)?;
    let dest = DestUser {
        addr: *real_server.ip(),
        port: real_server.port(),
        conn_flags: 0,
        weight: 0,
    };
    client.del_dest(&svc, &dest).await?;
    println!("Destination deleted: {real_server}");
    Ok(())
}

// ── Flush / zero ────────────────────────────────────────────────────────

pub async fn cmd_flush(client: &mut ControlClient) -> Result<()> {
    client.flush().await?;
    println!("All virtual services deleted.");
    Ok(())
}

pub async fn cmd_zero(
    client: &mut ControlClient,
    selector: &ServiceSelector,
    mark_protocol: MarkProtocol,
) -> Result<()> {
    if selector.is_empty() {
        client.zero(&ServiceUser::default()).await?;
        println!("All counters zeroed.");
    } else {
        let svc = selector_user(selector, mark_protocol)?;
        client.zero(&svc).await?;
        println!(
            "Counters zeroed: {}",
            ServiceRow::new(&entry_of(svc), None).service
        );
    }
    Ok(())
}

// ── Timeouts ────────────────────────────────────────────────────────────

pub async fn cmd_timeouts_get(client: &mut ControlClient, output: OutputFormat) -> Result<()> {
    let t = client.timeouts().await?;

    if output == OutputFormat::Json {
        return print_json(&serde_json::json!({
            "tcp": t.tcp,
            "tcp_fin": t.tcp_fin,
            "udp": t.udp,
        }));
    }

    println!("Timeout (tcp tcpfin udp): {} {} {}", t.tcp, t.tcp_fin, t.udp);
    Ok(())
}

pub async fn cmd_timeouts_set(
    client: &mut ControlClient,
    tcp: Option<u32>,
    tcp_fin: Option<u32>,
    udp: Option<u32>,
) -> Result<()> {
    if tcp.is_none() && tcp_fin.is_none() && udp.is_none() {
        bail!("nothing to set: give --tcp, --tcp-fin or --udp");
    }
    // Zero leaves a timeout unchanged.
    let t = TimeoutsUser {
        tcp: tcp.unwrap_or(0),
        tcp_fin: tcp_fin.unwrap_or(0),
        udp: udp.unwrap_or(0),
    };
    client.set_timeouts(&t).await?;
    println!("Timeouts updated.");
    Ok(())
}

// ── Sync daemons ────────────────────────────────────────────────────────

pub async fn cmd_daemon_start(
    client: &mut ControlClient,
    role: DaemonRole,
    mcast_interface: &str,
    syncid: i32,
) -> Result<()> {
    let state = match role {
        DaemonRole::Master => DAEMON_STATE_MASTER,
        DaemonRole::Backup => DAEMON_STATE_BACKUP,
    };
    client
        .start_daemon(&DaemonUser {
            state,
            mcast_ifn: encode_name(mcast_interface)?,
            syncid,
        })
        .await?;
    println!("Sync daemon started: {role:?} on {mcast_interface} (syncid={syncid})");
    Ok(())
}

pub async fn cmd_daemon_stop(client: &mut ControlClient) -> Result<()> {
    client.stop_daemons().await?;
    println!("Sync daemons stopped.");
    Ok(())
}

#[derive(Serialize)]
struct DaemonRow {
    role: &'static str,
    running: bool,
    mcast_interface: String,
    syncid: i32,
}

fn daemon_row(role: &'static str, d: &DaemonUser) -> DaemonRow {
    DaemonRow {
        role,
        running: d.state != 0,
        mcast_interface: decode_name(&d.mcast_ifn).unwrap_or_default(),
        syncid: d.syncid,
    }
}

pub async fn cmd_daemon_status(client: &mut ControlClient, output: OutputFormat) -> Result<()> {
    let (master, backup) = client.daemons().await?;
    let rows = [daemon_row("master", &master), daemon_row("backup", &backup)];

    if output == OutputFormat::Json {
        return print_json(&rows);
    }

    for row in rows.iter().filter(|r| r.running) {
        println!(
            "{} sync daemon (mcast={}, syncid={})",
            row.role, row.mcast_interface, row.syncid
        );
    }
    if rows.iter().all(|r| !r.running) {
        println!("No sync daemon running.");
    }
    Ok(())
}

// ── Defense ─────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct DefenseRow {
    drop_entry: u32,
    drop_packet: u32,
    secure_tcp: u32,
    amemthresh: u32,
    am_droprate: u32,
    cache_bypass: u32,
    expire_nodest_conn: u32,
    sync_threshold: [u32; 2],
    nat_icmp_send: u32,
    drop_rate: u32,
    drop_entry_active: bool,
    drop_packet_active: bool,
    secure_tcp_active: bool,
}

impl From<&DefenseEntry> for DefenseRow {
    fn from(e: &DefenseEntry) -> Self {
        let t = &e.tunables;
        Self {
            drop_entry: t.drop_entry,
            drop_packet: t.drop_packet,
            secure_tcp: t.secure_tcp,
            amemthresh: t.amemthresh,
            am_droprate: t.am_droprate,
            cache_bypass: t.cache_bypass,
            expire_nodest_conn: t.expire_nodest_conn,
            sync_threshold: t.sync_threshold,
            nat_icmp_send: t.nat_icmp_send,
            drop_rate: e.drop_rate,
            drop_entry_active: e.effective & EFFECTIVE_DROP_ENTRY != 0,
            drop_packet_active: e.effective & EFFECTIVE_DROP_PACKET != 0,
            secure_tcp_active: e.effective & EFFECTIVE_SECURE_TCP != 0,
        }
    }
}

pub async fn cmd_defense_get(client: &mut ControlClient, output: OutputFormat) -> Result<()> {
    let row = DefenseRow::from(&client.defense().await?);

    if output == OutputFormat::Json {
        return print_json(&row);
    }

    println!("Adaptive defense");
    println!(
        "  drop_entry:   level {} ({})",
        row.drop_entry,
        on_off(row.drop_entry_active)
    );
    println!(
        "  drop_packet:  level {} ({}, rate {})",
        row.drop_packet,
        on_off(row.drop_packet_active),
        row.drop_rate
    );
    println!(
        "  secure_tcp:   level {} ({})",
        row.secure_tcp,
        on_off(row.secure_tcp_active)
    );
    println!("  amemthresh:   {} pages", row.amemthresh);
    println!("  am_droprate:  {}", row.am_droprate);
    println!(
        "  sync:         threshold {} period {}",
        row.sync_threshold[0], row.sync_threshold[1]
    );
    Ok(())
}

pub async fn cmd_defense_set(client: &mut ControlClient, args: &DefenseSetArgs) -> Result<()> {
    let update = defense_update(args)?;
    if update == DefenseUser::default() {
        bail!("nothing to set");
    }
    client.set_defense(&update).await?;
    println!("Defense tunables updated.");
    Ok(())
}

fn defense_update(args: &DefenseSetArgs) -> Result<DefenseUser> {
    let sync_threshold = match args.sync_threshold.as_deref() {
        None => [UNCHANGED; 2],
        Some([threshold, period]) => [*threshold, *period],
        Some(other) => bail!("--sync-threshold takes 2 values, got {}", other.len()),
    };
    let keep = |v: Option<u32>| v.unwrap_or(UNCHANGED);
    Ok(DefenseUser {
        drop_entry: keep(args.drop_entry),
        drop_packet: keep(args.drop_packet),
        secure_tcp: keep(args.secure_tcp),
        amemthresh: keep(args.amemthresh),
        am_droprate: keep(args.am_droprate),
        cache_bypass: keep(args.cache_bypass),
        expire_nodest_conn: keep(args.expire_nodest_conn),
        sync_threshold,
        nat_icmp_send: keep(args.nat_icmp_send),
    })
}

fn on_off(active: bool) -> &'static str {
    if active { "active" } else { "inactive" }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_selector() -> ServiceSelector {
        ServiceSelector {
            tcp: Some("10.0.0.1:80".parse().unwrap()),
            ..ServiceSelector::default()
        }
    }

    #[test]
    fn tcp_selector_encodes_tuple() {
        let u = selector_user(&tcp_selector(), MarkProtocol::Udp).unwrap();
        assert_eq!(u.protocol, 6);
        assert_eq!(u.port, 80);
        assert_eq!(u.addr, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(u.fwmark, 0);
    }

    #[test]
    fn mark_selector_uses_mark_protocol() {
        let sel = ServiceSelector {
            fwmark: Some(7),
            ..ServiceSelector::default()
        };
        let u = selector_user(&sel, MarkProtocol::Udp).unwrap();
        assert_eq!(u.protocol, 17);
        assert_eq!(u.fwmark, 7);
        assert!(u.addr.is_unspecified());
    }

    #[test]
    fn empty_or_zero_mark_selector_rejected() {
        assert!(selector_user(&ServiceSelector::default(), MarkProtocol::Tcp).is_err());
        let sel = ServiceSelector {
            fwmark: Some(0),
            ..ServiceSelector::default()
        };
        assert!(selector_user(&sel, MarkProtocol::Tcp).is_err());
    }

    #[test]
    fn persistent_sets_flag_and_timeout() {
        let args = ServiceArgs {
            selector: tcp_selector(),
            mark_protocol: MarkProtocol::Tcp,
            scheduler: "rr".to_string(),
            persistent: Some(360),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
        };
        let u = service_user(&args).unwrap();
        assert_eq!(u.flags, ServiceFlags::PERSISTENT);
        assert_eq!(u.timeout, 360);
        assert_eq!(decode_name(&u.sched_name).unwrap(), "rr");
    }

    #[test]
    fn overlong_scheduler_name_rejected() {
        let args = ServiceArgs {
            selector: tcp_selector(),
            mark_protocol: MarkProtocol::Tcp,
            scheduler: "a-very-long-scheduler-name".to_string(),
            persistent: None,
            netmask: Ipv4Addr::BROADCAST,
        };
        assert!(service_user(&args).is_err());
    }

    #[test]
    fn forwarding_maps_to_conn_flags() {
        assert_eq!(Forwarding::Masq.conn_flags(), 0);
        assert_eq!(Forwarding::Tunnel.conn_flags(), 2);
        assert_eq!(Forwarding::Route.conn_flags(), 3);
    }

    #[test]
    fn defense_update_keeps_unset_fields() {
        let args = DefenseSetArgs {
            drop_packet: Some(2),
            sync_threshold: Some(vec![3, 50]),
            ..DefenseSetArgs::default()
        };
        let u = defense_update(&args).unwrap();
        assert_eq!(u.drop_packet, 2);
        assert_eq!(u.sync_threshold, [3, 50]);
        assert_eq!(u.drop_entry, UNCHANGED);
        assert_eq!(u.amemthresh, UNCHANGED);
    }

    #[test]
    fn empty_defense_update_is_default() {
        let u = defense_update(&DefenseSetArgs::default()).unwrap();
        assert_eq!(u, DefenseUser::default());
    }

    #[test]
    fn service_row_formats_mark_and_persistence() {
        let entry = entry_of(ServiceUser {
            protocol: 17,
            fwmark: 9,
            flags: ServiceFlags::PERSISTENT,
            timeout: 300,
            sched_name: encode_name("rr").unwrap(),
            ..ServiceUser::default()
        });
        let row = ServiceRow::new(&entry, None);
        assert_eq!(row.protocol, "UDP");
        assert_eq!(row.service, "FWM 9");
        assert_eq!(row.persistent, Some(300));
        assert_eq!(row.scheduler, "rr");
    }
}
