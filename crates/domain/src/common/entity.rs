use std::fmt;

use serde::{Deserialize, Serialize};

/// Transport protocol of a virtual service.
///
/// Only TCP and UDP are balanced, including for firewall-mark services
/// which still record a protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// IP protocol number.
    pub const fn number(self) -> u16 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
        }
    }

    /// Parse an IP protocol number. Anything but TCP or UDP is `None`.
    pub fn from_number(n: u16) -> Option<Self> {
        match n {
            6 => Some(Self::Tcp),
            17 => Some(Self::Udp),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of an administrative caller on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub uid: u32,
    /// Whether the caller holds the network-administration capability.
    pub admin: bool,
}

impl Caller {
    pub const fn new(uid: u32, admin: bool) -> Self {
        Self { uid, admin }
    }

    /// An in-process caller such as startup provisioning.
    pub const fn internal() -> Self {
        Self { uid: 0, admin: true }
    }
}
