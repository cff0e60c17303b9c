use serde::Serialize;

use super::error::IpvsError;

/// Longest interface name accepted for the sync multicast interface.
pub const MAX_IFNAME_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncRole {
    Master,
    Backup,
}

impl SyncRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Backup => "backup",
        }
    }

    /// Wire state code: 1 master, 2 backup.
    pub fn code(self) -> i32 {
        match self {
            Self::Master => 1,
            Self::Backup => 2,
        }
    }

    pub fn from_code(code: i32) -> Result<Self, IpvsError> {
        match code {
            1 => Ok(Self::Master),
            2 => Ok(Self::Backup),
            other => Err(IpvsError::InvalidDaemon(format!("unknown state {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DaemonConfig {
    pub role: SyncRole,
    pub mcast_ifn: String,
    pub syncid: i32,
}

impl DaemonConfig {
    pub fn validate(&self) -> Result<(), IpvsError> {
        if self.mcast_ifn.is_empty() || self.mcast_ifn.len() > MAX_IFNAME_LEN {
            return Err(IpvsError::InvalidDaemon(format!(
                "interface name {:?} must be 1..={MAX_IFNAME_LEN} bytes",
                self.mcast_ifn
            )));
        }
        if !(0..=255).contains(&self.syncid) {
            return Err(IpvsError::InvalidDaemon(format!(
                "syncid {} out of range 0..=255",
                self.syncid
            )));
        }
        Ok(())
    }
}

/// Bookkeeping for the master and backup connection-sync daemons.
///
/// Only the requested configuration is recorded; no replication traffic is
/// produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncDaemons {
    master: Option<DaemonConfig>,
    backup: Option<DaemonConfig>,
}

impl SyncDaemons {
    fn slot(&mut self, role: SyncRole) -> &mut Option<DaemonConfig> {
        match role {
            SyncRole::Master => &mut self.master,
            SyncRole::Backup => &mut self.backup,
        }
    }

    pub fn start(&mut self, cfg: DaemonConfig) -> Result<(), IpvsError> {
        cfg.validate()?;
        let role = cfg.role;
        let slot = self.slot(role);
        if slot.is_some() {
            return Err(IpvsError::DaemonRunning {
                role: role.as_str(),
            });
        }
        *slot = Some(cfg);
        Ok(())
    }

    /// Stop every running daemon, returning what was stopped.
    pub fn stop_all(&mut self) -> Result<Vec<DaemonConfig>, IpvsError> {
        let stopped: Vec<DaemonConfig> =
            self.master.take().into_iter().chain(self.backup.take()).collect();
        if stopped.is_empty() {
            return Err(IpvsError::DaemonNotRunning);
        }
        Ok(stopped)
    }

    pub fn master(&self) -> Option<&DaemonConfig> {
        self.master.as_ref()
    }

    pub fn backup(&self) -> Option<&DaemonConfig> {
        self.backup.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_cfg(role: SyncRole) -> DaemonConfig {
        DaemonConfig {
            role,
            mcast_ifn: "eth0".to_string(),
            syncid: 1,
        }
    }

    #[test]
    fn start_each_role_once() {
        let mut d = SyncDaemons::default();
        d.start(make_cfg(SyncRole::Master)).unwrap();
        d.start(make_cfg(SyncRole::Backup)).unwrap();
        assert!(matches!(
            d.start(make_cfg(SyncRole::Master)),
            Err(IpvsError::DaemonRunning { role: "master" })
        ));
        assert_eq!(d.master().unwrap().mcast_ifn, "eth0");
    }

    #[test]
    fn stop_all_then_not_running() {
        let mut d = SyncDaemons::default();
        d.start(make_cfg(SyncRole::Backup)).unwrap();
        let stopped = d.stop_all().unwrap();
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].role, SyncRole::Backup);
        assert!(matches!(d.stop_all(), Err(IpvsError::DaemonNotRunning)));
    }

    #[test]
    fn validation() {
        let mut cfg = make_cfg(SyncRole::Master);
        cfg.mcast_ifn = String::new();
        assert!(cfg.validate().is_err());
        cfg.mcast_ifn = "eth0".to_string();
        cfg.syncid = 300;
        assert!(cfg.validate().is_err());
        assert!(SyncRole::from_code(3).is_err());
        assert_eq!(SyncRole::from_code(2).unwrap(), SyncRole::Backup);
    }
}
