use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::DefenseError;

pub const DEFAULT_AMEMTHRESH: u32 = 1024;
pub const DEFAULT_AM_DROPRATE: u32 = 10;
pub const DEFAULT_SYNC_THRESHOLD: [u32; 2] = [3, 50];

/// Operating level of one defense control.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefenseLevel {
    /// Never engages.
    #[default]
    Off = 0,
    /// Engages under memory pressure and latches to `AutoActive`.
    AutoLatchable = 1,
    /// Engaged while memory is low, falls back to `AutoLatchable`.
    AutoActive = 2,
    AlwaysOn = 3,
}

impl DefenseLevel {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::AutoLatchable => "auto",
            Self::AutoActive => "auto_active",
            Self::AlwaysOn => "always",
        }
    }

    /// One tick of the level state machine.
    ///
    /// Returns the next level and whether the control is engaged for the
    /// coming interval. Each control is evaluated on its own level and the
    /// shared memory verdict only, so evaluation order does not matter.
    pub fn transition(self, low_memory: bool) -> (Self, bool) {
        match (self, low_memory) {
            (Self::Off, _) => (Self::Off, false),
            (Self::AutoLatchable | Self::AutoActive, true) => (Self::AutoActive, true),
            (Self::AutoLatchable | Self::AutoActive, false) => (Self::AutoLatchable, false),
            (Self::AlwaysOn, _) => (Self::AlwaysOn, true),
        }
    }
}

impl TryFrom<u32> for DefenseLevel {
    type Error = DefenseError;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Off),
            1 => Ok(Self::AutoLatchable),
            2 => Ok(Self::AutoActive),
            3 => Ok(Self::AlwaysOn),
            other => Err(DefenseError::InvalidLevel(other)),
        }
    }
}

impl fmt::Display for DefenseLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.as_str(), self.as_u32())
    }
}

/// Administrative defense settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefenseTunables {
    pub drop_entry: DefenseLevel,
    pub drop_packet: DefenseLevel,
    pub secure_tcp: DefenseLevel,
    /// Low-memory threshold in pages.
    pub amemthresh: u32,
    /// Packet drop interval used at `AlwaysOn`.
    pub am_droprate: u32,
    pub cache_bypass: bool,
    pub expire_nodest_conn: bool,
    pub sync_threshold: [u32; 2],
    pub nat_icmp_send: bool,
}

impl Default for DefenseTunables {
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
        }
    }
}

impl DefenseTunables {
    pub fn validate(&self) -> Result<(), DefenseError> {
        if self.amemthresh == 0 {
            return Err(DefenseError::InvalidTunable {
                name: "amemthresh",
                reason: "must be positive",
            });
        }
        if self.am_droprate == 0 {
            return Err(DefenseError::InvalidTunable {
                name: "am_droprate",
                reason: "must be positive",
            });
        }
        let [threshold, period] = self.sync_threshold;
        if period == 0 || threshold >= period {
            return Err(DefenseError::InvalidTunable {
                name: "sync_threshold",
                reason: "threshold must be below a nonzero period",
            });
        }
        Ok(())
    }

    /// Apply a partial update, validating the result as a whole.
    pub fn merged(&self, update: &DefenseUpdate) -> Result<Self, DefenseError> {
        let next = Self {
            drop_entry: update.drop_entry.unwrap_or(self.drop_entry),
            drop_packet: update.drop_packet.unwrap_or(self.drop_packet),
            secure_tcp: update.secure_tcp.unwrap_or(self.secure_tcp),
            amemthresh: update.amemthresh.unwrap_or(self.amemthresh),
            am_droprate: update.am_droprate.unwrap_or(self.am_droprate),
            cache_bypass: update.cache_bypass.unwrap_or(self.cache_bypass),
            expire_nodest_conn: update.expire_nodest_conn.unwrap_or(self.expire_nodest_conn),
            sync_threshold: update.sync_threshold.unwrap_or(self.sync_threshold),
            nat_icmp_send: update.nat_icmp_send.unwrap_or(self.nat_icmp_send),
        };
        next.validate()?;
        Ok(next)
    }
}

/// Partial tunable change. `None` leaves a field as is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DefenseUpdate {
    pub drop_entry: Option<DefenseLevel>,
    pub drop_packet: Option<DefenseLevel>,
    pub secure_tcp: Option<DefenseLevel>,
    pub amemthresh: Option<u32>,
    pub am_droprate: Option<u32>,
    pub cache_bypass: Option<bool>,
    pub expire_nodest_conn: Option<bool>,
    pub sync_threshold: Option<[u32; 2]>,
    pub nat_icmp_send: Option<bool>,
}

/// Which controls are engaged for the current interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EffectiveFlags {
    pub drop_entry: bool,
    pub drop_packet: bool,
    pub secure_tcp: bool,
}

/// Point-in-time defense state for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DefenseSnapshot {
    pub tunables: DefenseTunables,
    pub effective: EffectiveFlags,
    pub drop_rate: u32,
}
