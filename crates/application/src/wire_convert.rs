//! Conversions between control-channel payloads and domain types.

use std::fmt;

use domain::common::entity::Protocol;
use domain::common::error::DomainError;
use domain::defense::entity::{DefenseLevel, DefenseSnapshot, DefenseUpdate};
use domain::defense::timeouts::UserTimeouts;
use domain::ipvs::daemon::{DaemonConfig, SyncRole};
use domain::ipvs::entity::{
    DEFAULT_SCHEDULER, DestConfig, DestView, ForwardingMethod, ServiceConfig, ServiceFlags,
    ServiceKey, ServiceView,
};
use domain::ipvs::error::IpvsError;
use domain::ipvs::stats::StatsSnapshot;
use ipvs_common::user::{
    DAEMON_STATE_NONE, DaemonUser, DefenseEntry, DefenseUser, DestEntry, DestUser,
    EFFECTIVE_DROP_ENTRY, EFFECTIVE_DROP_PACKET, EFFECTIVE_SECURE_TCP, ServiceEntry,
    ServiceUser, StatsUser, TimeoutsUser, UNCHANGED, decode_name, encode_name,
};

pub(crate) fn invalid(e: impl fmt::Display) -> DomainError {
    DomainError::InvalidArgument(e.to_string())
}

// ── Requests ──────────────────────────────────────────────────────────

pub fn service_key(u: &ServiceUser) -> Result<ServiceKey, DomainError> {
    let protocol =
        Protocol::from_number(u.protocol).ok_or(IpvsError::UnsupportedProtocol(u.protocol))?;
    Ok(ServiceKey::new(protocol, u.addr, u.port, u.fwmark))
}

/// Full service definition. An empty scheduler name selects the default.
pub fn service_config(u: &ServiceUser) -> Result<ServiceConfig, DomainError> {
    let key = service_key(u)?;
    let name = decode_name(&u.sched_name).map_err(invalid)?;
    let scheduler = if name.is_empty() {
        DEFAULT_SCHEDULER.to_string()
    } else {
        name
    };
    Ok(ServiceConfig {
        key,
        scheduler,
        flags: ServiceFlags::from_user(u.flags)?,
        timeout: u.timeout,
        netmask: u.netmask,
    })
}

pub fn dest_config(u: &DestUser) -> Result<DestConfig, DomainError> {
    Ok(DestConfig {
        addr: u.addr,
        port: u.port,
        weight: u.weight,
        forwarding: ForwardingMethod::from_conn_flags(u.conn_flags)?,
    })
}

pub fn user_timeouts(u: &TimeoutsUser) -> UserTimeouts {
    UserTimeouts {
        tcp: u.tcp,
        tcp_fin: u.tcp_fin,
        udp: u.udp,
    }
}

pub fn daemon_config(u: &DaemonUser) -> Result<DaemonConfig, DomainError> {
    Ok(DaemonConfig {
        role: SyncRole::from_code(u.state)?,
        mcast_ifn: decode_name(&u.mcast_ifn).map_err(invalid)?,
        syncid: u.syncid,
    })
}

fn level(v: u32) -> Result<Option<DefenseLevel>, DomainError> {
    if v == UNCHANGED {
        return Ok(None);
    }
    Ok(Some(DefenseLevel::try_from(v)?))
}

fn number(v: u32) -> Option<u32> {
    (v != UNCHANGED).then_some(v)
}

fn flag(v: u32) -> Option<bool> {
    (v != UNCHANGED).then_some(v != 0)
}

/// Partial defense update. `UNCHANGED` fields are skipped; the sync
/// threshold pair must be set or skipped as a whole.
pub fn defense_update(u: &DefenseUser) -> Result<DefenseUpdate, DomainError> {
    let sync_threshold = match u.sync_threshold {
        [UNCHANGED, UNCHANGED] => None,
        [a, b] if a != UNCHANGED && b != UNCHANGED => Some([a, b]),
        _ => return Err(invalid("sync_threshold must be set as a pair")),
    };
    Ok(DefenseUpdate {
        drop_entry: level(u.drop_entry)?,
        drop_packet: level(u.drop_packet)?,
        secure_tcp: level(u.secure_tcp)?,
        amemthresh: number(u.amemthresh),
        am_droprate: number(u.am_droprate),
        cache_bypass: flag(u.cache_bypass),
        expire_nodest_conn: flag(u.expire_nodest_conn),
        sync_threshold,
        nat_icmp_send: flag(u.nat_icmp_send),
    })
}

// ── Replies ───────────────────────────────────────────────────────────

pub fn stats_user(s: &StatsSnapshot) -> StatsUser {
    StatsUser {
        conns: s.conns,
        inpkts: s.inpkts,
        outpkts: s.outpkts,
        inbytes: s.inbytes,
        outbytes: s.outbytes,
        cps: s.cps,
        inpps: s.inpps,
        outpps: s.outpps,
        inbps: s.inbps,
        outbps: s.outbps,
    }
}

pub fn service_user(key: &ServiceKey) -> ServiceUser {
    ServiceUser {
        protocol: key.protocol().number(),
        port: key.port(),
        addr: key.addr(),
        fwmark: key.fwmark(),
        ..ServiceUser::default()
    }
}

pub fn service_entry(v: &ServiceView) -> Result<ServiceEntry, DomainError> {
    let service = ServiceUser {
        sched_name: encode_name(&v.scheduler).map_err(invalid)?,
        flags: v.flags.bits(),
        timeout: v.timeout,
        netmask: v.netmask,
        ..service_user(&v.key)
    };
    Ok(ServiceEntry {
        service,
        num_dests: u32::try_from(v.num_dests).unwrap_or(u32::MAX),
        stats: stats_user(&v.stats),
    })
}

pub fn dest_entry(v: &DestView) -> DestEntry {
    DestEntry {
        addr: v.addr,
        port: v.port,
        conn_flags: v.conn_flags,
        weight: v.weight,
        active_conns: v.active_conns,
        inactive_conns: v.inactive_conns,
        stats: stats_user(&v.stats),
    }
}

pub fn timeouts_user(t: &UserTimeouts) -> TimeoutsUser {
    TimeoutsUser {
        tcp: t.tcp,
        tcp_fin: t.tcp_fin,
        udp: t.udp,
    }
}

pub fn daemon_user(cfg: Option<&DaemonConfig>) -> DaemonUser {
    match cfg {
        Some(c) => DaemonUser {
            state: c.role.code(),
            mcast_ifn: encode_name(&c.mcast_ifn).unwrap_or_default(),
            syncid: c.syncid,
        },
        None => DaemonUser {
            state: DAEMON_STATE_NONE,
            ..DaemonUser::default()
        },
    }
}

pub fn defense_entry(s: &DefenseSnapshot) -> DefenseEntry {
    let t = &s.tunables;
    let mut effective = 0;
    if s.effective.drop_entry {
        effective |= EFFECTIVE_DROP_ENTRY;
    }
    if s.effective.drop_packet {
        effective |= EFFECTIVE_DROP_PACKET;
    }
    if s.effective.secure_tcp {
        effective |= EFFECTIVE_SECURE_TCP;
    }
    DefenseEntry {
        tunables: DefenseUser {
            drop_entry: t.drop_entry.as_u32(),
            drop_packet: t.drop_packet.as_u32(),
            secure_tcp: t.secure_tcp.as_u32(),
            amemthresh: t.amemthresh,
            am_droprate: t.am_droprate,
            cache_bypass: u32::from(t.cache_bypass),
            expire_nodest_conn: u32::from(t.expire_nodest_conn),
            sync_threshold: t.sync_threshold,
            nat_icmp_send: u32::from(t.nat_icmp_send),
        },
        drop_rate: s.drop_rate,
        effective,
    }
}
