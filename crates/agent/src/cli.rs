use std::net::{Ipv4Addr, SocketAddrV4};

use clap::{Args, Parser, Subcommand, ValueEnum};
use infrastructure::config::{LogFormat, LogLevel};
use infrastructure::constants::{DEFAULT_CONFIG_PATH, DEFAULT_CONTROL_SOCKET};

#[derive(Parser, Debug)]
#[command(
    name = "ipvs-agent",
    about = "ipvs-sentinel virtual server daemon and admin client",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: String,

    /// Log level override (takes precedence over config file)
    #[arg(short, long)]
    pub log_level: Option<LogLevel>,

    /// Log format: json (default, production) or text (development)
    #[arg(long)]
    pub log_format: Option<LogFormat>,

    /// Control socket of the running daemon
    #[arg(
        long,
        default_value = DEFAULT_CONTROL_SOCKET,
        env = "IPVS_SENTINEL_SOCKET",
        global = true
    )]
    pub socket: String,

    /// Output format
    #[arg(short, long, default_value = "table", global = true)]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Output format for CLI commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table (default)
    Table,
    /// JSON document
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Display client and daemon version
    Version,

    /// Show daemon version, connection table size and service count
    Info,

    /// List virtual services
    List {
        /// Include each service's destinations
        #[arg(long)]
        dests: bool,
    },

    /// Add, edit or delete a virtual service
    #[command(subcommand)]
    Service(ServiceCommand),

    /// Add, edit or delete a destination of a virtual service
    #[command(subcommand)]
    Dest(DestCommand),

    /// Delete every virtual service
    Flush,

    /// Zero packet counters of one service, or of everything
    Zero {
        #[command(flatten)]
        selector: ServiceSelector,

        /// Protocol of a firewall-mark service
        #[arg(long, value_enum, default_value_t = MarkProtocol::Tcp)]
        mark_protocol: MarkProtocol,
    },

    /// Read or change connection timeouts
    #[command(subcommand)]
    Timeouts(TimeoutsCommand),

    /// Start, stop or inspect the connection sync daemons
    #[command(subcommand)]
    Daemon(DaemonCommand),

    /// Read or change the adaptive defense tunables
    #[command(subcommand)]
    Defense(DefenseCommand),
}

// ── Selectors ───────────────────────────────────────────────────────────

/// Protocol of a firewall-mark service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum MarkProtocol {
    #[default]
    Tcp,
    Udp,
}

/// Identifies a virtual service by TCP/UDP endpoint or firewall mark.
#[derive(Args, Debug, Clone, Default)]
#[group(multiple = false)]
pub struct ServiceSelector {
    /// TCP service address as ADDR:PORT
    #[arg(short = 't', long = "tcp-service", value_name = "ADDR:PORT")]
    pub tcp: Option<SocketAddrV4>,

    /// UDP service address as ADDR:PORT
    #[arg(short = 'u', long = "udp-service", value_name = "ADDR:PORT")]
    pub udp: Option<SocketAddrV4>,

    /// Firewall mark of the service
    #[arg(short = 'f', long = "fwmark-service", value_name = "MARK")]
    pub fwmark: Option<u32>,
}

impl ServiceSelector {
    pub fn is_empty(&self) -> bool {
        self.tcp.is_none() && self.udp.is_none() && self.fwmark.is_none()
    }
}

// ── Services ────────────────────────────────────────────────────────────

#[derive(Subcommand, Debug)]
pub enum ServiceCommand {
    /// Add a virtual service
    Add(ServiceArgs),
    /// Replace the scheduler, flags, timeout and netmask of a service
    Edit(ServiceArgs),
    /// Delete a virtual service and all its destinations
    Del {
        #[command(flatten)]
        selector: ServiceSelector,

        /// Protocol of a firewall-mark service
        #[arg(long, value_enum, default_value_t = MarkProtocol::Tcp)]
        mark_protocol: MarkProtocol,
    },
}

#[derive(Args, Debug, Clone)]
pub struct ServiceArgs {
    #[command(flatten)]
    pub selector: ServiceSelector,

    /// Protocol of a firewall-mark service
    #[arg(long, value_enum, default_value_t = MarkProtocol::Tcp)]
    pub mark_protocol: MarkProtocol,

    /// Scheduler name
    #[arg(short, long, default_value = "rr")]
    pub scheduler: String,

    /// Make the service persistent with this timeout in seconds
    #[arg(short, long, value_name = "SECONDS")]
    pub persistent: Option<u32>,

    /// Persistence granularity mask
    #[arg(short = 'M', long, default_value = "255.255.255.255")]
    pub netmask: Ipv4Addr,
}

// ── Destinations ────────────────────────────────────────────────────────

/// Packet forwarding method of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Forwarding {
    /// NAT (masquerading)
    Masq,
    /// IP-in-IP tunnelling
    Tunnel,
    /// Direct routing (gatewaying)
    Route,
}

#[derive(Subcommand, Debug)]
pub enum DestCommand {
    /// Add a destination to a virtual service
    Add(DestArgs),
    /// Change a destination's weight or forwarding method
    Edit(DestArgs),
    /// Remove a destination from a virtual service
    Del {
        #[command(flatten)]
        selector: ServiceSelector,

        /// Protocol of a firewall-mark service
        #[arg(long, value_enum, default_value_t = MarkProtocol::Tcp)]
        mark_protocol: MarkProtocol,

        /// Real server address as ADDR:PORT
        #[arg(short, long = "real-server", value_name = "ADDR:PORT")]
        real_server: SocketAddrV4,
    },
}

#[derive(Args, Debug, Clone)]
pub struct DestArgs {
    #[command(flatten)]
    pub selector: ServiceSelector,

    /// Protocol of a firewall-mark service
    #[arg(long, value_enum, default_value_t = MarkProtocol::Tcp)]
    pub mark_protocol: MarkProtocol,

    /// Real server address as ADDR:PORT
    #[arg(short, long = "real-server", value_name = "ADDR:PORT")]
    pub real_server: SocketAddrV4,

    /// Scheduling weight; 0 quiesces the destination
    #[arg(short, long, default_value_t = 1)]
    pub weight: i32,

    /// Packet forwarding method
    #[arg(long, value_enum, default_value_t = Forwarding::Route)]
    pub forwarding: Forwarding,
}

// ── Timeouts ────────────────────────────────────────────────────────────

#[derive(Subcommand, Debug)]
pub enum TimeoutsCommand {
    /// Show the established, fin-wait and udp timeouts
    Get,
    /// Change timeouts; omitted values stay unchanged
    Set {
        /// Established TCP timeout in seconds
        #[arg(long)]
        tcp: Option<u32>,
        /// TCP fin-wait timeout in seconds
        #[arg(long)]
        tcp_fin: Option<u32>,
        /// UDP timeout in seconds
        #[arg(long)]
        udp: Option<u32>,
    },
}

// ── Sync daemons ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DaemonRole {
    Master,
    Backup,
}

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Record a sync daemon as running
    Start {
        #[arg(value_enum)]
        role: DaemonRole,
        /// Multicast interface name
        #[arg(long, default_value = "eth0")]
        mcast_interface: String,
        /// Sync group id
        #[arg(long, default_value_t = 0)]
        syncid: i32,
    },
    /// Stop all sync daemons
    Stop,
    /// Show master and backup daemon state
    Status,
}

// ── Defense ─────────────────────────────────────────────────────────────

#[derive(Subcommand, Debug)]
pub enum DefenseCommand {
    /// Show tunables, effective strategies and the current drop rate
    Get,
    /// Change tunables; omitted values stay unchanged
    Set(DefenseSetArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct DefenseSetArgs {
    /// Random connection-entry drop level (0..=3)
    #[arg(long, value_parser = clap::value_parser!(u32).range(0..=3))]
    pub drop_entry: Option<u32>,
    /// Rate-based packet drop level (0..=3)
    #[arg(long, value_parser = clap::value_parser!(u32).range(0..=3))]
    pub drop_packet: Option<u32>,
    /// Hardened TCP timeout level (0..=3)
    #[arg(long, value_parser = clap::value_parser!(u32).range(0..=3))]
    pub secure_tcp: Option<u32>,
    /// Available-memory threshold in pages
    #[arg(long)]
    pub amemthresh: Option<u32>,
    /// Drop rate used when packet dropping is always on
    #[arg(long)]
    pub am_droprate: Option<u32>,
    #[arg(long)]
    pub cache_bypass: Option<u32>,
    #[arg(long)]
    pub expire_nodest_conn: Option<u32>,
    /// Sync threshold and period, given together
    #[arg(long, num_args = 2, value_names = ["THRESHOLD", "PERIOD"])]
    pub sync_threshold: Option<Vec<u32>>,
    #[arg(long)]
    pub nat_icmp_send: Option<u32>,
}

/// Parse CLI arguments.
pub fn parse() -> Cli {
    Cli::parse()
}
