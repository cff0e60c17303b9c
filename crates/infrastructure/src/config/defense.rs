//! Defense tunables and connection timeout overrides.

use std::collections::BTreeMap;
use std::time::Duration;

use domain::defense::entity::{
    DEFAULT_AM_DROPRATE, DEFAULT_AMEMTHRESH, DEFAULT_SYNC_THRESHOLD, DefenseLevel, DefenseTunables,
};
use domain::defense::timeouts::{ConnState, ConnTimeouts, TimeoutTable};
use serde::{Deserialize, Serialize};

use super::common::{ConfigError, validation};
use crate::constants::DEFAULT_DEFENSE_TICK;

/// Initial defense settings. Levels are `off`, `auto_latchable`,
/// `auto_active` or `always_on`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DefenseConfig {
    #[serde(default)]
    pub drop_entry: DefenseLevel,

    #[serde(default)]
    pub drop_packet: DefenseLevel,

    #[serde(default)]
    pub secure_tcp: DefenseLevel,

    /// Low-memory threshold in pages.
    #[serde(default = "default_amemthresh")]
    pub amemthresh: u32,

    #[serde(default = "default_am_droprate")]
    pub am_droprate: u32,

    #[serde(default)]
    pub cache_bypass: bool,

    #[serde(default)]
    pub expire_nodest_conn: bool,

    #[serde(default = "default_sync_threshold")]
    pub sync_threshold: [u32; 2],

    #[serde(default)]
    pub nat_icmp_send: bool,

    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl Default for DefenseConfig {
    fn default() -> Self {
        Self {
            drop_entry: DefenseLevel::Off,
            drop_packet: DefenseLevel::Off,
            secure_tcp: DefenseLevel::Off,
            amemthresh: DEFAULT_AMEMTHRESH,
            am_droprate: DEFAULT_AM_DROPRATE,
            cache_bypass: false,
            expire_nodest_conn: false,
            sync_threshold: DEFAULT_SYNC_THRESHOLD,
            nat_icmp_send: false,
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

fn default_amemthresh() -> u32 {
    DEFAULT_AMEMTHRESH
}

fn default_am_droprate() -> u32 {
    DEFAULT_AM_DROPRATE
}

fn default_sync_threshold() -> [u32; 2] {
    DEFAULT_SYNC_THRESHOLD
}

fn default_tick_interval_ms() -> u64 {
    u64::try_from(DEFAULT_DEFENSE_TICK.as_millis()).unwrap_or(1000)
}

impl DefenseConfig {
    pub fn tunables(&self) -> DefenseTunables {
        DefenseTunables {
            drop_entry: self.drop_entry,
            drop_packet: self.drop_packet,
            secure_tcp: self.secure_tcp,
            amemthresh: self.amemthresh,
            am_droprate: self.am_droprate,
            cache_bypass: self.cache_bypass,
            expire_nodest_conn: self.expire_nodest_conn,
            sync_threshold: self.sync_threshold,
            nat_icmp_send: self.nat_icmp_send,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tunables()
            .validate()
            .map_err(|e| validation("defense", e.to_string()))?;
        // Tunables must take effect within one second.
        if self.tick_interval_ms == 0 || self.tick_interval_ms > 1000 {
            return Err(validation(
                "defense.tick_interval_ms",
                "must be between 1 and 1000",
            ));
        }
        Ok(())
    }
}

/// Per-state idle timeout overrides in seconds, keyed by state name
/// (`established`, `fin_wait`, `udp`, ...). Unlisted states keep their
/// defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeoutsConfig {
    pub overrides: BTreeMap<String, u64>,
}

impl TimeoutsConfig {
    pub fn to_domain(&self) -> Result<ConnTimeouts, ConfigError> {
        let mut table = TimeoutTable::normal();
        for (name, secs) in &self.overrides {
            let state = ConnState::from_name(name)
                .map_err(|e| validation(format!("timeouts.{name}"), e.to_string()))?;
            if *secs == 0 {
                return Err(validation(format!("timeouts.{name}"), "must be positive"));
            }
            table.set(state, Duration::from_secs(*secs));
        }
        Ok(ConnTimeouts::new(table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_domain() {
        let cfg: DefenseConfig = serde_yaml_ng::from_str("{}").unwrap();
        assert_eq!(cfg.tunables(), DefenseTunables::default());
        assert_eq!(cfg.tick_interval(), Duration::from_secs(1));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn levels_parse_by_name() {
        let cfg: DefenseConfig =
            serde_yaml_ng::from_str("drop_packet: auto_latchable\nsecure_tcp: always_on\n")
                .unwrap();
        assert_eq!(cfg.drop_packet, DefenseLevel::AutoLatchable);
        assert_eq!(cfg.secure_tcp, DefenseLevel::AlwaysOn);
        assert_eq!(cfg.drop_entry, DefenseLevel::Off);
    }

    #[test]
    fn zero_amemthresh_rejected() {
        let cfg: DefenseConfig = serde_yaml_ng::from_str("amemthresh: 0\n").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn slow_tick_rejected() {
        let cfg: DefenseConfig = serde_yaml_ng::from_str("tick_interval_ms: 5000\n").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn timeout_overrides_apply_to_normal_table() {
        let cfg: TimeoutsConfig =
            serde_yaml_ng::from_str("established: 600\nudp: 30\n").unwrap();
        let timeouts = cfg.to_domain().unwrap();
        assert_eq!(
            timeouts.normal().get(ConnState::Established),
            Duration::from_secs(600)
        );
        assert_eq!(timeouts.normal().get(ConnState::Udp), Duration::from_secs(30));
        assert_eq!(
            timeouts.normal().get(ConnState::FinWait),
            Duration::from_secs(120)
        );
    }

    #[test]
    fn unknown_state_rejected() {
        let cfg: TimeoutsConfig = serde_yaml_ng::from_str("bogus: 10\n").unwrap();
        let err = cfg.to_domain().unwrap_err();
        assert!(err.to_string().contains("timeouts.bogus"));
    }

    #[test]
    fn zero_timeout_rejected() {
        let cfg: TimeoutsConfig = serde_yaml_ng::from_str("udp: 0\n").unwrap();
        assert!(cfg.to_domain().is_err());
    }
}
