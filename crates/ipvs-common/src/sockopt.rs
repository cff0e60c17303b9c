//! Command identifiers of the administrative control channel.
//!
//! Identifiers keep the historical socket-option numbering so tooling that
//! logs raw command codes stays readable.

use crate::error::WireError;

/// First identifier of the control range.
pub const SOCKOPT_BASE: u32 = 64 + 1024 + 64;

/// Version reported by `GetVersion` / `GetInfo`, encoded as `0xMMmmpp`.
pub const VERSION_CODE: u32 = 0x01_00_08;

/// Largest request payload accepted for any command.
pub const MAX_ARG_LEN: usize = 128;

/// Largest reply a client may declare for array-returning get commands.
pub const MAX_REPLY_LEN: usize = 16 * 1024 * 1024;

/// Minimum reply capacity for `GetVersion`.
pub const VERSION_REPLY_LEN: usize = 64;

/// Human-readable version, e.g. `1.0.8`.
pub fn version_triplet(code: u32) -> String {
    format!("{}.{}.{}", (code >> 16) & 0xff, (code >> 8) & 0xff, code & 0xff)
}

// ── Set commands ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SetCommand {
    AddService = SOCKOPT_BASE + 2,
    EditService = SOCKOPT_BASE + 3,
    DelService = SOCKOPT_BASE + 4,
    Flush = SOCKOPT_BASE + 5,
    AddDest = SOCKOPT_BASE + 7,
    DelDest = SOCKOPT_BASE + 8,
    EditDest = SOCKOPT_BASE + 9,
    Timeouts = SOCKOPT_BASE + 10,
    StartDaemon = SOCKOPT_BASE + 11,
    StopDaemon = SOCKOPT_BASE + 12,
    Zero = SOCKOPT_BASE + 15,
    Defense = SOCKOPT_BASE + 16,
}

impl SetCommand {
    pub const ALL: [Self; 12] = [
        Self::AddService,
        Self::EditService,
        Self::DelService,
        Self::Flush,
        Self::AddDest,
        Self::DelDest,
        Self::EditDest,
        Self::Timeouts,
        Self::StartDaemon,
        Self::StopDaemon,
        Self::Zero,
        Self::Defense,
    ];

    /// Exact payload length this command carries.
    pub fn arg_len(self) -> usize {
        use crate::user::{DaemonUser, DefenseUser, DestUser, ServiceUser, TimeoutsUser, Wire};
        match self {
            Self::AddService | Self::EditService | Self::DelService | Self::Zero => {
                ServiceUser::SIZE
            }
            Self::AddDest | Self::DelDest | Self::EditDest => ServiceUser::SIZE + DestUser::SIZE,
            Self::Timeouts => TimeoutsUser::SIZE,
            Self::StartDaemon => DaemonUser::SIZE,
            Self::Flush | Self::StopDaemon => 0,
            Self::Defense => DefenseUser::SIZE,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::AddService => "add_service",
            Self::EditService => "edit_service",
            Self::DelService => "del_service",
            Self::Flush => "flush",
            Self::AddDest => "add_dest",
            Self::DelDest => "del_dest",
            Self::EditDest => "edit_dest",
            Self::Timeouts => "set_timeouts",
            Self::StartDaemon => "start_daemon",
            Self::StopDaemon => "stop_daemon",
            Self::Zero => "zero",
            Self::Defense => "set_defense",
        }
    }
}

impl TryFrom<u32> for SetCommand {
    type Error = WireError;

    fn try_from(cmd: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|c| *c as u32 == cmd)
            .ok_or(WireError::UnknownCommand { kind: "set", cmd })
    }
}

// ── Get commands ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum GetCommand {
    Version = SOCKOPT_BASE,
    Info = SOCKOPT_BASE + 1,
    Services = SOCKOPT_BASE + 2,
    Service = SOCKOPT_BASE + 3,
    Dests = SOCKOPT_BASE + 4,
    Timeouts = SOCKOPT_BASE + 6,
    Daemon = SOCKOPT_BASE + 7,
    Defense = SOCKOPT_BASE + 8,
}

impl GetCommand {
    pub const ALL: [Self; 8] = [
        Self::Version,
        Self::Info,
        Self::Services,
        Self::Service,
        Self::Dests,
        Self::Timeouts,
        Self::Daemon,
        Self::Defense,
    ];

    /// Exact request payload length this command carries.
    pub fn arg_len(self) -> usize {
        use crate::user::{GetDestsHeader, GetServicesHeader, ServiceEntry, Wire};
        match self {
            Self::Services => GetServicesHeader::SIZE,
            Self::Service => ServiceEntry::SIZE,
            Self::Dests => GetDestsHeader::SIZE,
            Self::Version | Self::Info | Self::Timeouts | Self::Daemon | Self::Defense => 0,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Version => "get_version",
            Self::Info => "get_info",
            Self::Services => "get_services",
            Self::Service => "get_service",
            Self::Dests => "get_dests",
            Self::Timeouts => "get_timeouts",
            Self::Daemon => "get_daemon",
            Self::Defense => "get_defense",
        }
    }
}

impl TryFrom<u32> for GetCommand {
    type Error = WireError;

    fn try_from(cmd: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|c| *c as u32 == cmd)
            .ok_or(WireError::UnknownCommand { kind: "get", cmd })
    }
}
