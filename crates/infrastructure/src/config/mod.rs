//! Agent configuration: structs, parsing, and validation.
//!
//! The config module is split across several sub-modules:
//! - `common`: shared helpers and `ConfigError`
//! - `defense`: defense tunables and connection timeouts
//! - `ipvs`: virtual services declared at startup

mod common;
mod defense;
mod ipvs;

// ── Public re-exports ─────────────────────────────────────────────

pub use common::{ConfigError, parse_ipv4};
pub use defense::{DefenseConfig, TimeoutsConfig};
pub use ipvs::{DestinationConfig, VirtualServiceConfig};

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use domain::defense::entity::DefenseTunables;
use domain::defense::timeouts::ConnTimeouts;
use domain::ipvs::entity::{DestConfig, ServiceConfig};
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_CONN_TAB_BITS, DEFAULT_CONTROL_SOCKET, DEFAULT_HTTP_PORT, MAX_CONN_TAB_BITS,
    MIN_CONN_TAB_BITS,
};
use common::{MAX_LOCAL_ADDRESSES, MAX_SERVICES, check_limit, validation, warn_if_world_readable};

// ── Top-level config ───────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent: AgentInfo,

    #[serde(default)]
    pub defense: DefenseConfig,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    #[serde(default)]
    pub services: Vec<VirtualServiceConfig>,
}

impl AgentConfig {
    /// Load config from a YAML file.
    ///
    /// On Unix, logs a warning if the config file is world-readable.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        warn_if_world_readable(path, "config file");
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse config from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the config after deserialization.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.control_socket.trim().is_empty() {
            return Err(validation("agent.control_socket", "must not be empty"));
        }
        if !(MIN_CONN_TAB_BITS..=MAX_CONN_TAB_BITS).contains(&self.agent.conn_tab_bits) {
            return Err(validation(
                "agent.conn_tab_bits",
                format!("must be between {MIN_CONN_TAB_BITS} and {MAX_CONN_TAB_BITS}"),
            ));
        }
        parse_ipv4(&self.agent.bind_address, "agent.bind_address")?;
        check_limit(
            "agent.local_addresses",
            self.agent.local_addresses.len(),
            MAX_LOCAL_ADDRESSES,
        )?;
        self.local_addresses()?;

        self.defense.validate()?;
        self.timeouts.to_domain()?;

        check_limit("services", self.services.len(), MAX_SERVICES)?;
        self.virtual_services()?;
        Ok(())
    }

    /// Connection table size reported to clients.
    pub fn conn_tab_size(&self) -> u32 {
        1u32 << self.agent.conn_tab_bits
    }

    pub fn local_addresses(&self) -> Result<Vec<Ipv4Addr>, ConfigError> {
        self.agent
            .local_addresses
            .iter()
            .enumerate()
            .map(|(i, a)| parse_ipv4(a, &format!("agent.local_addresses[{i}]")))
            .collect()
    }

    /// Declared services with their destinations. Duplicate service keys or
    /// duplicate destinations within a service are rejected.
    pub fn virtual_services(&self) -> Result<Vec<(ServiceConfig, Vec<DestConfig>)>, ConfigError> {
        let mut keys = HashSet::new();
        let mut out = Vec::with_capacity(self.services.len());
        for (i, svc) in self.services.iter().enumerate() {
            let field = format!("services[{i}]");
            let (service, dests) = svc.to_domain(&field)?;
            if !keys.insert(service.key) {
                return Err(validation(field, "duplicate virtual service"));
            }
            let mut seen = HashSet::new();
            for (j, d) in dests.iter().enumerate() {
                if !seen.insert((d.addr, d.port)) {
                    return Err(validation(
                        format!("{field}.destinations[{j}]"),
                        "duplicate destination",
                    ));
                }
            }
            out.push((service, dests));
        }
        Ok(out)
    }

    pub fn defense_tunables(&self) -> DefenseTunables {
        self.defense.tunables()
    }

    pub fn conn_timeouts(&self) -> Result<ConnTimeouts, ConfigError> {
        self.timeouts.to_domain()
    }

    pub fn defense_tick(&self) -> Duration {
        self.defense.tick_interval()
    }
}

// ── Agent section ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentInfo {
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// Unix socket the control channel listens on.
    #[serde(default = "default_control_socket")]
    pub control_socket: String,

    /// Uids granted the administrative capability besides root.
    #[serde(default)]
    pub admin_uids: Vec<u32>,

    /// IP address the HTTP observability server binds to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Disable the HTTP observability server.
    #[serde(default = "default_true")]
    pub http_enabled: bool,

    #[serde(default = "default_conn_tab_bits")]
    pub conn_tab_bits: u8,

    /// Addresses owned by this host. Destinations on them forward locally.
    #[serde(default)]
    pub local_addresses: Vec<String>,
}

impl Default for AgentInfo {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            control_socket: default_control_socket(),
            admin_uids: Vec::new(),
            bind_address: default_bind_address(),
            http_port: default_http_port(),
            http_enabled: true,
            conn_tab_bits: default_conn_tab_bits(),
            local_addresses: Vec::new(),
        }
    }
}

impl AgentInfo {
    /// Root always holds the administrative capability.
    pub fn is_admin(&self, uid: u32) -> bool {
        uid == 0 || self.admin_uids.contains(&uid)
    }
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}
fn default_log_format() -> LogFormat {
    LogFormat::Json
}
fn default_control_socket() -> String {
    DEFAULT_CONTROL_SOCKET.to_string()
}
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}
fn default_http_port() -> u16 {
    DEFAULT_HTTP_PORT
}
fn default_conn_tab_bits() -> u8 {
    DEFAULT_CONN_TAB_BITS
}
fn default_true() -> bool {
    true
}

// ── Log level ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            _ => Err(format!(
                "invalid log level '{s}': expected error|warn|info|debug|trace"
            )),
        }
    }
}

// ── Log format ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Text => "text",
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" | "pretty" => Ok(Self::Text),
            _ => Err(format!("invalid log format '{s}': expected json|text")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use domain::common::entity::Protocol;
    use domain::defense::entity::DefenseLevel;
    use domain::defense::timeouts::ConnState;
    use domain::ipvs::entity::ServiceKey;

    use super::*;

    // ── Minimal config loading ────────────────────────────────────

    #[test]
    fn empty_config_uses_defaults() {
        let config = AgentConfig::from_yaml("{}").unwrap();
        assert_eq!(config.agent.log_level, LogLevel::Info);
        assert_eq!(config.agent.log_format, LogFormat::Json);
        assert_eq!(config.agent.control_socket, DEFAULT_CONTROL_SOCKET);
        assert_eq!(config.agent.http_port, DEFAULT_HTTP_PORT);
        assert_eq!(config.conn_tab_size(), 4096);
        assert!(config.services.is_empty());
        assert_eq!(config.defense_tunables(), DefenseTunables::default());
    }

    #[test]
    fn unknown_section_rejected() {
        assert!(AgentConfig::from_yaml("firewall: {}\n").is_err());
    }

    #[test]
    fn conn_tab_bits_out_of_range() {
        assert!(AgentConfig::from_yaml("agent:\n  conn_tab_bits: 30\n").is_err());
        assert!(AgentConfig::from_yaml("agent:\n  conn_tab_bits: 4\n").is_err());
    }

    #[test]
    fn bad_local_address_rejected() {
        let yaml = "agent:\n  local_addresses: [10.0.0.1, nope]\n";
        let err = AgentConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("agent.local_addresses[1]"));
    }

    #[test]
    fn admin_uids() {
        let config = AgentConfig::from_yaml("agent:\n  admin_uids: [1000]\n").unwrap();
        assert!(config.agent.is_admin(0));
        assert!(config.agent.is_admin(1000));
        assert!(!config.agent.is_admin(1001));
    }

    // ── Full config ───────────────────────────────────────────────

    const FULL: &str = r"
agent:
  log_level: debug
  log_format: text
  control_socket: /tmp/ipvs.sock
  http_port: 9100
  conn_tab_bits: 16
  local_addresses: [192.168.0.10]

defense:
  drop_packet: auto_latchable
  amemthresh: 2048
  am_droprate: 20

timeouts:
  established: 600

services:
  - addr: 10.0.0.1
    port: 80
    scheduler: rr
    destinations:
      - addr: 10.0.1.1
        port: 8080
      - addr: 10.0.1.2
        port: 8080
        weight: 3
  - protocol: udp
    fwmark: 9
";

    #[test]
    fn load_full_config() {
        let config = AgentConfig::from_yaml(FULL).unwrap();
        assert_eq!(config.agent.log_level, LogLevel::Debug);
        assert_eq!(config.agent.log_format, LogFormat::Text);
        assert_eq!(config.conn_tab_size(), 65536);
        assert_eq!(
            config.local_addresses().unwrap(),
            vec![Ipv4Addr::new(192, 168, 0, 10)]
        );

        let tunables = config.defense_tunables();
        assert_eq!(tunables.drop_packet, DefenseLevel::AutoLatchable);
        assert_eq!(tunables.amemthresh, 2048);

        let timeouts = config.conn_timeouts().unwrap();
        assert_eq!(
            timeouts.normal().get(ConnState::Established),
            Duration::from_secs(600)
        );

        let services = config.virtual_services().unwrap();
        assert_eq!(services.len(), 2);
        assert_eq!(
            services[0].0.key,
            ServiceKey::tuple(Protocol::Tcp, Ipv4Addr::new(10, 0, 0, 1), 80)
        );
        assert_eq!(services[0].1.len(), 2);
        assert_eq!(services[0].1[1].weight, 3);
        assert_eq!(services[1].0.key, ServiceKey::mark(Protocol::Udp, 9));
    }

    #[test]
    fn duplicate_service_rejected() {
        let yaml = r"
services:
  - addr: 10.0.0.1
    port: 80
  - addr: 10.0.0.1
    port: 80
";
        let err = AgentConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("services[1]"));
    }

    #[test]
    fn duplicate_destination_rejected() {
        let yaml = r"
services:
  - addr: 10.0.0.1
    port: 80
    destinations:
      - addr: 10.0.1.1
        port: 80
      - addr: 10.0.1.1
        port: 80
";
        assert!(AgentConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn same_mark_different_protocol_is_distinct_key() {
        let yaml = r"
services:
  - protocol: tcp
    fwmark: 5
  - protocol: udp
    fwmark: 5
";
        // Mark uniqueness across protocols is enforced by the registry.
        assert!(AgentConfig::from_yaml(yaml).is_ok());
    }

    #[test]
    fn invalid_defense_rejected() {
        assert!(AgentConfig::from_yaml("defense:\n  am_droprate: 0\n").is_err());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FULL.as_bytes()).unwrap();
        let config = AgentConfig::load(file.path()).unwrap();
        assert_eq!(config.services.len(), 2);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = AgentConfig::load(Path::new("/nonexistent/ipvs.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn yaml_error_is_reported() {
        let err = AgentConfig::from_yaml("agent: [").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }

    // ── Log settings ──────────────────────────────────────────────

    #[test]
    fn log_format_from_str() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn log_level_from_str() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
    }
}
