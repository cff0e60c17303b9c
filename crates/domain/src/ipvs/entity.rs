use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::common::entity::Protocol;
use crate::ipvs::error::IpvsError;
use crate::ipvs::stats::StatsSnapshot;

/// FTP control port. A registered service on this port enables the
/// FTP data-connection fallback in lookups.
pub const FTPPORT: u16 = 21;
/// FTP active-mode data port.
pub const FTPDATA: u16 = 20;
/// First unprivileged port.
pub const PROT_SOCK: u16 = 1024;

/// Name of the scheduler bound when none is given.
pub const DEFAULT_SCHEDULER: &str = "rr";

// ── Service key ───────────────────────────────────────────────────────

/// Identity of a virtual service: a 3-tuple, or a nonzero firewall mark.
///
/// Mark services still carry a protocol, which administrative selectors
/// must match, but packet lookups by mark ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServiceKey {
    Tuple {
        protocol: Protocol,
        addr: Ipv4Addr,
        port: u16,
    },
    Mark {
        protocol: Protocol,
        fwmark: u32,
    },
}

impl ServiceKey {
    /// Build a key from selector fields. A nonzero mark wins.
    pub fn new(protocol: Protocol, addr: Ipv4Addr, port: u16, fwmark: u32) -> Self {
        if fwmark == 0 {
            Self::Tuple {
                protocol,
                addr,
                port,
            }
        } else {
            Self::Mark { protocol, fwmark }
        }
    }

    pub fn tuple(protocol: Protocol, addr: Ipv4Addr, port: u16) -> Self {
        Self::Tuple {
            protocol,
            addr,
            port,
        }
    }

    pub fn mark(protocol: Protocol, fwmark: u32) -> Self {
        Self::Mark { protocol, fwmark }
    }

    pub fn protocol(&self) -> Protocol {
        match *self {
            Self::Tuple { protocol, .. } | Self::Mark { protocol, .. } => protocol,
        }
    }

    pub fn addr(&self) -> Ipv4Addr {
        match *self {
            Self::Tuple { addr, .. } => addr,
            Self::Mark { .. } => Ipv4Addr::UNSPECIFIED,
        }
    }

    pub fn port(&self) -> u16 {
        match *self {
            Self::Tuple { port, .. } => port,
            Self::Mark { .. } => 0,
        }
    }

    /// Firewall mark, zero for tuple services.
    pub fn fwmark(&self) -> u32 {
        match *self {
            Self::Tuple { .. } => 0,
            Self::Mark { fwmark, .. } => fwmark,
        }
    }

    pub fn is_mark(&self) -> bool {
        matches!(self, Self::Mark { .. })
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tuple {
                protocol,
                addr,
                port,
            } => write!(f, "{protocol} {addr}:{port}"),
            Self::Mark { protocol, fwmark } => write!(f, "FWM {fwmark} ({protocol})"),
        }
    }
}

// ── Flags ─────────────────────────────────────────────────────────────

/// Virtual service flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceFlags(u32);

impl ServiceFlags {
    pub const PERSISTENT: u32 = 0x0001;
    pub const HASHED: u32 = 0x0002;

    /// Accept flags from an administrative request. The hashed bit is
    /// registry state and is ignored; any other unknown bit is rejected.
    pub fn from_user(bits: u32) -> Result<Self, IpvsError> {
        if bits & !(Self::PERSISTENT | Self::HASHED) != 0 {
            return Err(IpvsError::InvalidFlags(bits));
        }
        Ok(Self(bits & Self::PERSISTENT))
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_persistent(self) -> bool {
        self.0 & Self::PERSISTENT != 0
    }

    pub fn is_hashed(self) -> bool {
        self.0 & Self::HASHED != 0
    }

    pub(crate) fn with_hashed(self, hashed: bool) -> Self {
        if hashed {
            Self(self.0 | Self::HASHED)
        } else {
            Self(self.0 & !Self::HASHED)
        }
    }

    /// Keep the hashed bit of `self`, take everything else from `user`.
    pub(crate) fn replace_user_bits(self, user: Self) -> Self {
        user.with_hashed(self.is_hashed())
    }
}

// ── Forwarding ────────────────────────────────────────────────────────

/// Connection flag bits stored on a destination.
pub mod conn_flags {
    pub const FWD_MASK: u32 = 0x0007;
    pub const MASQ: u32 = 0x0000;
    pub const LOCALNODE: u32 = 0x0001;
    pub const TUNNEL: u32 = 0x0002;
    pub const DROUTE: u32 = 0x0003;
    pub const BYPASS: u32 = 0x0004;
    pub const NOOUTPUT: u32 = 0x0080;
    pub const INACTIVE: u32 = 0x0100;
}

/// How packets reach a destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardingMethod {
    #[default]
    Masquerade,
    LocalNode,
    Tunnel,
    DirectRoute,
}

impl ForwardingMethod {
    pub fn bits(self) -> u32 {
        match self {
            Self::Masquerade => conn_flags::MASQ,
            Self::LocalNode => conn_flags::LOCALNODE,
            Self::Tunnel => conn_flags::TUNNEL,
            Self::DirectRoute => conn_flags::DROUTE,
        }
    }

    /// Extract the method from the low bits of a connection flag word.
    pub fn from_conn_flags(flags: u32) -> Result<Self, IpvsError> {
        match flags & conn_flags::FWD_MASK {
            conn_flags::MASQ => Ok(Self::Masquerade),
            conn_flags::LOCALNODE => Ok(Self::LocalNode),
            conn_flags::TUNNEL => Ok(Self::Tunnel),
            conn_flags::DROUTE => Ok(Self::DirectRoute),
            other => Err(IpvsError::InvalidForwarding(other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Masquerade => "masq",
            Self::LocalNode => "local",
            Self::Tunnel => "tunnel",
            Self::DirectRoute => "route",
        }
    }
}

/// Compute the stored flag word for a destination.
///
/// New and updated destinations carry the inactive template bit. Every
/// method other than masquerade skips output processing.
pub fn destination_conn_flags(method: ForwardingMethod) -> u32 {
    let mut flags = method.bits() | conn_flags::INACTIVE;
    if method != ForwardingMethod::Masquerade {
        flags |= conn_flags::NOOUTPUT;
    }
    flags
}

// ── Address classification ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Unicast,
    Local,
}

/// Classify a destination address. Local addresses force local-node
/// forwarding; non-unicast addresses are rejected.
pub fn classify_address(
    addr: Ipv4Addr,
    is_local: impl Fn(Ipv4Addr) -> bool,
) -> Result<AddressKind, IpvsError> {
    if addr.is_unspecified() || addr.is_broadcast() || addr.is_multicast() {
        return Err(IpvsError::InvalidAddress(addr));
    }
    if addr.is_loopback() || is_local(addr) {
        Ok(AddressKind::Local)
    } else {
        Ok(AddressKind::Unicast)
    }
}

// ── Requests ──────────────────────────────────────────────────────────

/// Requested attributes of a virtual service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub key: ServiceKey,
    pub scheduler: String,
    pub flags: ServiceFlags,
    /// Persistence timeout in seconds.
    pub timeout: u32,
    pub netmask: Ipv4Addr,
}

impl ServiceConfig {
    pub fn new(key: ServiceKey) -> Self {
        Self {
            key,
            scheduler: DEFAULT_SCHEDULER.to_string(),
            flags: ServiceFlags::default(),
            timeout: 0,
            netmask: Ipv4Addr::BROADCAST,
        }
    }

    #[must_use]
    pub fn with_scheduler(mut self, name: impl Into<String>) -> Self {
        self.scheduler = name.into();
        self
    }
}

/// Requested attributes of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestConfig {
    pub addr: Ipv4Addr,
    pub port: u16,
    pub weight: i32,
    pub forwarding: ForwardingMethod,
}

impl DestConfig {
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self {
            addr,
            port,
            weight: 1,
            forwarding: ForwardingMethod::Masquerade,
        }
    }

    pub fn validate(&self) -> Result<(), IpvsError> {
        if self.weight < 0 {
            return Err(IpvsError::InvalidWeight(self.weight));
        }
        Ok(())
    }
}

// ── Read views ────────────────────────────────────────────────────────

/// Point-in-time copy of a service for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceView {
    pub key: ServiceKey,
    pub scheduler: String,
    pub flags: ServiceFlags,
    pub timeout: u32,
    pub netmask: Ipv4Addr,
    pub num_dests: usize,
    pub stats: StatsSnapshot,
}

/// Point-in-time copy of a destination for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestView {
    pub addr: Ipv4Addr,
    pub port: u16,
    pub weight: i32,
    pub conn_flags: u32,
    pub forwarding: ForwardingMethod,
    pub active_conns: u32,
    pub inactive_conns: u32,
    pub stats: StatsSnapshot,
}
