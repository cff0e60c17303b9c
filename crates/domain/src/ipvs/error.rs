use std::net::Ipv4Addr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IpvsError {
    #[error("unsupported protocol {0}: only TCP and UDP are balanced")]
    UnsupportedProtocol(u16),

    #[error("invalid weight {0}: must not be negative")]
    InvalidWeight(i32),

    #[error("invalid forwarding method {0}")]
    InvalidForwarding(u32),

    #[error("invalid destination address {0}")]
    InvalidAddress(Ipv4Addr),

    #[error("invalid service selector: {0}")]
    InvalidSelector(String),

    #[error("invalid service flags {0:#x}")]
    InvalidFlags(u32),

    #[error("virtual service {key} already exists")]
    ServiceExists { key: String },

    #[error("virtual service {key} not found")]
    ServiceNotFound { key: String },

    #[error("destination {addr} already exists")]
    DestExists { addr: String },

    #[error("destination {addr} not found")]
    DestNotFound { addr: String },

    #[error("scheduler {name} not found")]
    SchedulerNotFound { name: String },

    #[error("scheduler {name} already registered")]
    SchedulerExists { name: String },

    #[error("scheduler {name} failed to bind: {reason}")]
    SchedulerBind { name: String, reason: String },

    #[error("{source}; restoring scheduler {previous} also failed: {rollback}")]
    SchedulerRollback {
        previous: String,
        source: Box<IpvsError>,
        rollback: Box<IpvsError>,
    },

    #[error("allocation failed for {0}")]
    OutOfMemory(&'static str),

    #[error("{role} sync daemon already running")]
    DaemonRunning { role: &'static str },

    #[error("no sync daemon running")]
    DaemonNotRunning,

    #[error("invalid sync daemon request: {0}")]
    InvalidDaemon(String),
}
