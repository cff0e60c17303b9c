use std::time::Duration;

use serde::Serialize;

use super::error::DefenseError;

/// Connection states with their own idle timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    None,
    Established,
    SynSent,
    SynRecv,
    FinWait,
    TimeWait,
    Close,
    CloseWait,
    LastAck,
    Listen,
    SynAck,
    Udp,
    Icmp,
}

impl ConnState {
    pub const ALL: [Self; 13] = [
        Self::None,
        Self::Established,
        Self::SynSent,
        Self::SynRecv,
        Self::FinWait,
        Self::TimeWait,
        Self::Close,
        Self::CloseWait,
        Self::LastAck,
        Self::Listen,
        Self::SynAck,
        Self::Udp,
        Self::Icmp,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Established => "established",
            Self::SynSent => "syn_sent",
            Self::SynRecv => "syn_recv",
            Self::FinWait => "fin_wait",
            Self::TimeWait => "time_wait",
            Self::Close => "close",
            Self::CloseWait => "close_wait",
            Self::LastAck => "last_ack",
            Self::Listen => "listen",
            Self::SynAck => "synack",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, DefenseError> {
        Self::ALL
            .into_iter()
            .find(|s| s.name() == name)
            .ok_or_else(|| DefenseError::UnknownState(name.to_string()))
    }

    fn index(self) -> usize {
        self as usize
    }
}

const fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

const fn mins(m: u64) -> Duration {
    Duration::from_secs(m * 60)
}

/// Idle timeouts indexed by [`ConnState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutTable {
    values: [Duration; 13],
}

impl TimeoutTable {
    pub const fn normal() -> Self {
        Self {
            values: [
                mins(30),
                mins(15),
                mins(2),
                mins(1),
                mins(2),
                mins(2),
                secs(10),
                secs(60),
                secs(30),
                mins(2),
                secs(120),
                mins(5),
                mins(1),
            ],
        }
    }

    /// Shorter timeouts used while secure TCP is engaged.
    pub const fn secure() -> Self {
        Self {
            values: [
                mins(15),
                mins(8),
                secs(60),
                secs(10),
                secs(60),
                secs(60),
                secs(10),
                secs(60),
                secs(30),
                mins(2),
                secs(100),
                mins(3),
                mins(1),
            ],
        }
    }

    pub fn get(&self, state: ConnState) -> Duration {
        self.values[state.index()]
    }

    pub fn set(&mut self, state: ConnState, timeout: Duration) {
        self.values[state.index()] = timeout;
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConnState, Duration)> + '_ {
        ConnState::ALL.into_iter().map(|s| (s, self.get(s)))
    }
}

/// The three timeouts exposed over the control channel, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UserTimeouts {
    pub tcp: u32,
    pub tcp_fin: u32,
    pub udp: u32,
}

/// Normal and hardened tables plus the secure-TCP selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnTimeouts {
    normal: TimeoutTable,
    secure: TimeoutTable,
    secure_active: bool,
}

impl Default for ConnTimeouts {
    fn default() -> Self {
        Self::new(TimeoutTable::normal())
    }
}

fn to_secs(d: Duration) -> u32 {
    u32::try_from(d.as_secs()).unwrap_or(u32::MAX)
}

impl ConnTimeouts {
    pub fn new(normal: TimeoutTable) -> Self {
        Self {
            normal,
            secure: TimeoutTable::secure(),
            secure_active: false,
        }
    }

    pub fn normal(&self) -> &TimeoutTable {
        &self.normal
    }

    pub fn is_secure(&self) -> bool {
        self.secure_active
    }

    pub fn set_secure(&mut self, active: bool) {
        self.secure_active = active;
    }

    /// Table in force for new and refreshed connections.
    pub fn effective(&self) -> &TimeoutTable {
        if self.secure_active {
            &self.secure
        } else {
            &self.normal
        }
    }

    pub fn user(&self) -> UserTimeouts {
        UserTimeouts {
            tcp: to_secs(self.normal.get(ConnState::Established)),
            tcp_fin: to_secs(self.normal.get(ConnState::FinWait)),
            udp: to_secs(self.normal.get(ConnState::Udp)),
        }
    }

    /// Update the normal table. Zero fields are left unchanged.
    pub fn set_user(&mut self, t: UserTimeouts) {
        for (state, value) in [
            (ConnState::Established, t.tcp),
            (ConnState::FinWait, t.tcp_fin),
            (ConnState::Udp, t.udp),
        ] {
            if value != 0 {
                self.normal.set(state, secs(u64::from(value)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_user_timeouts() {
        let t = ConnTimeouts::default();
        assert_eq!(
            t.user(),
            UserTimeouts {
                tcp: 900,
                tcp_fin: 120,
                udp: 300,
            }
        );
    }

    #[test]
    fn zero_fields_unchanged() {
        let mut t = ConnTimeouts::default();
        t.set_user(UserTimeouts {
            tcp: 60,
            tcp_fin: 0,
            udp: 0,
        });
        assert_eq!(
            t.user(),
            UserTimeouts {
                tcp: 60,
                tcp_fin: 120,
                udp: 300,
            }
        );
    }

    #[test]
    fn secure_switches_effective_table() {
        let mut t = ConnTimeouts::default();
        assert_eq!(t.effective().get(ConnState::SynRecv), Duration::from_secs(60));
        t.set_secure(true);
        assert_eq!(t.effective().get(ConnState::SynRecv), Duration::from_secs(10));
        assert_eq!(t.effective().get(ConnState::Established), Duration::from_secs(480));
        // User timeouts always report the normal table.
        assert_eq!(t.user().tcp, 900);
    }

    #[test]
    fn set_user_leaves_secure_table_alone() {
        let mut t = ConnTimeouts::default();
        t.set_user(UserTimeouts {
            tcp: 5,
            tcp_fin: 5,
            udp: 5,
        });
        t.set_secure(true);
        assert_eq!(t.effective().get(ConnState::Udp), Duration::from_secs(180));
    }

    #[test]
    fn state_names_roundtrip() {
        for s in ConnState::ALL {
            assert_eq!(ConnState::from_name(s.name()).unwrap(), s);
        }
        assert!(ConnState::from_name("bogus").is_err());
    }

    #[test]
    fn table_iter_covers_all_states() {
        let table = TimeoutTable::normal();
        assert_eq!(table.iter().count(), 13);
        assert_eq!(table.get(ConnState::SynAck), Duration::from_secs(120));
        assert_eq!(table.get(ConnState::None), Duration::from_secs(1800));
    }
}
