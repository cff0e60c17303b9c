//! Virtual service configuration applied at startup.

use std::net::Ipv4Addr;

use domain::ipvs::entity::{
    DEFAULT_SCHEDULER, DestConfig, ForwardingMethod, ServiceConfig, ServiceFlags, ServiceKey,
};
use serde::{Deserialize, Serialize};

use super::common::{
    ConfigError, MAX_DESTS_PER_SERVICE, check_limit, parse_ipv4, parse_protocol, validation,
};

/// A virtual service, selected by `(protocol, addr, port)` or by a nonzero
/// firewall mark.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VirtualServiceConfig {
    /// `tcp` or `udp`. Mark services still record one.
    #[serde(default = "default_protocol")]
    pub protocol: String,

    #[serde(default)]
    pub addr: Option<String>,

    #[serde(default)]
    pub port: u16,

    #[serde(default)]
    pub fwmark: u32,

    #[serde(default = "default_scheduler")]
    pub scheduler: String,

    #[serde(default)]
    pub persistent: bool,

    /// Persistence timeout in seconds.
    #[serde(default)]
    pub timeout_secs: u32,

    #[serde(default = "default_netmask")]
    pub netmask: String,

    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DestinationConfig {
    pub addr: String,
    pub port: u16,

    #[serde(default = "default_weight")]
    pub weight: i32,

    /// `masquerade`, `local_node`, `tunnel` or `direct_route`.
    #[serde(default)]
    pub forwarding: ForwardingMethod,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

fn default_scheduler() -> String {
    DEFAULT_SCHEDULER.to_string()
}

fn default_netmask() -> String {
    "255.255.255.255".to_string()
}

fn default_weight() -> i32 {
    1
}

impl VirtualServiceConfig {
    /// Convert to the registry's request types. `field` prefixes error
    /// locations, e.g. `services[2]`.
    pub fn to_domain(&self, field: &str) -> Result<(ServiceConfig, Vec<DestConfig>), ConfigError> {
        let protocol = parse_protocol(&self.protocol, &format!("{field}.protocol"))?;
        let key = if self.fwmark != 0 {
            if self.addr.is_some() || self.port != 0 {
                return Err(validation(
                    field,
                    "a firewall-mark service must not set addr or port",
                ));
            }
            ServiceKey::mark(protocol, self.fwmark)
        } else {
            let addr = self
                .addr
                .as_deref()
                .ok_or_else(|| validation(field, "addr is required without fwmark"))?;
            let addr = parse_ipv4(addr, &format!("{field}.addr"))?;
            ServiceKey::tuple(protocol, addr, self.port)
        };

        if self.scheduler.trim().is_empty() {
            return Err(validation(format!("{field}.scheduler"), "must not be empty"));
        }
        check_limit(
            &format!("{field}.destinations"),
            self.destinations.len(),
            MAX_DESTS_PER_SERVICE,
        )?;

        let flags = if self.persistent {
            ServiceFlags::PERSISTENT
        } else {
            0
        };
        let service = ServiceConfig {
            key,
            scheduler: self.scheduler.clone(),
            flags: ServiceFlags::from_user(flags)
                .map_err(|e| validation(format!("{field}.persistent"), e.to_string()))?,
            timeout: self.timeout_secs,
            netmask: parse_ipv4(&self.netmask, &format!("{field}.netmask"))?,
        };

        let dests = self
            .destinations
            .iter()
            .enumerate()
            .map(|(i, d)| d.to_domain(&format!("{field}.destinations[{i}]")))
            .collect::<Result<Vec<_>, _>>()?;

        Ok((service, dests))
    }
}

impl DestinationConfig {
    pub fn to_domain(&self, field: &str) -> Result<DestConfig, ConfigError> {
        let addr: Ipv4Addr = parse_ipv4(&self.addr, &format!("{field}.addr"))?;
        let cfg = DestConfig {
            addr,
            port: self.port,
            weight: self.weight,
            forwarding: self.forwarding,
        };
        cfg.validate()
            .map_err(|e| validation(format!("{field}.weight"), e.to_string()))?;
        Ok(cfg)
    }
}
