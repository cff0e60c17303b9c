use thiserror::Error;

use crate::defense::error::DefenseError;
use crate::ipvs::error::IpvsError;

/// Errors surfaced to administrative callers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("interrupted: {0}")]
    Interrupted(String),
}

pub const EPERM: i32 = 1;
pub const ENOENT: i32 = 2;
pub const EINTR: i32 = 4;
pub const ENOMEM: i32 = 12;
pub const EEXIST: i32 = 17;
pub const EINVAL: i32 = 22;

impl DomainError {
    /// Positive errno for the control channel status field.
    pub fn errno(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) => EINVAL,
            Self::NotFound(_) => ENOENT,
            Self::AlreadyExists(_) => EEXIST,
            Self::OutOfMemory(_) => ENOMEM,
            Self::PermissionDenied(_) => EPERM,
            Self::Interrupted(_) => EINTR,
        }
    }

    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::OutOfMemory(_) => "out_of_memory",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Interrupted(_) => "interrupted",
        }
    }

    /// Inverse of `errno`, for clients decoding a status.
    pub fn from_errno(errno: i32, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match errno {
            ENOENT => Self::NotFound(detail),
            EEXIST => Self::AlreadyExists(detail),
            ENOMEM => Self::OutOfMemory(detail),
            EPERM => Self::PermissionDenied(detail),
            EINTR => Self::Interrupted(detail),
            _ => Self::InvalidArgument(detail),
        }
    }
}

impl From<IpvsError> for DomainError {
    fn from(e: IpvsError) -> Self {
        let msg = e.to_string();
        match e {
            IpvsError::ServiceNotFound { .. }
            | IpvsError::DestNotFound { .. }
            | IpvsError::SchedulerNotFound { .. }
            | IpvsError::DaemonNotRunning => Self::NotFound(msg),
            IpvsError::ServiceExists { .. }
            | IpvsError::DestExists { .. }
            | IpvsError::SchedulerExists { .. }
            | IpvsError::DaemonRunning { .. } => Self::AlreadyExists(msg),
            IpvsError::OutOfMemory(_) => Self::OutOfMemory(msg),
            IpvsError::UnsupportedProtocol(_)
            | IpvsError::InvalidWeight(_)
            | IpvsError::InvalidForwarding(_)
            | IpvsError::InvalidAddress(_)
            | IpvsError::InvalidFlags(_)
            | IpvsError::InvalidSelector(_)
            | IpvsError::SchedulerBind { .. }
            | IpvsError::SchedulerRollback { .. }
            | IpvsError::InvalidDaemon(_) => Self::InvalidArgument(msg),
        }
    }
}

impl From<DefenseError> for DomainError {
    fn from(e: DefenseError) -> Self {
        Self::InvalidArgument(e.to_string())
    }
}
