//! Shared parsing helpers and error types used across all config modules.

use std::net::Ipv4Addr;
use std::path::Path;

use domain::common::entity::Protocol;
use tracing::warn;

// ── Security limits ────────────────────────────────────────────────

/// Maximum virtual services declared in the config.
pub(super) const MAX_SERVICES: usize = 4096;
/// Maximum destinations per declared service.
pub(super) const MAX_DESTS_PER_SERVICE: usize = 1024;
/// Maximum local addresses.
pub(super) const MAX_LOCAL_ADDRESSES: usize = 256;

// ── Config errors ──────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(String),

    #[error("validation error: {field}: {message}")]
    Validation { field: String, message: String },

    #[error("invalid value '{value}' for field '{field}': expected one of {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },
}

impl From<serde_yaml_ng::Error> for ConfigError {
    fn from(e: serde_yaml_ng::Error) -> Self {
        Self::Yaml(e.to_string())
    }
}

pub(super) fn validation(field: impl Into<String>, message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        message: message.into(),
    }
}

// ── Parsing helpers ────────────────────────────────────────────────

/// Parse a dotted-quad IPv4 address.
pub fn parse_ipv4(s: &str, field: &str) -> Result<Ipv4Addr, ConfigError> {
    s.trim()
        .parse()
        .map_err(|_| validation(field, format!("invalid IPv4 address '{s}'")))
}

pub(super) fn parse_protocol(s: &str, field: &str) -> Result<Protocol, ConfigError> {
    match s.to_lowercase().as_str() {
        "tcp" => Ok(Protocol::Tcp),
        "udp" => Ok(Protocol::Udp),
        _ => Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: s.to_string(),
            expected: "tcp, udp".to_string(),
        }),
    }
}

/// Log a warning if a file is world-readable (Unix only).
#[cfg(unix)]
pub(super) fn warn_if_world_readable(path: &Path, label: &str) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = std::fs::metadata(path) {
        let mode = metadata.permissions().mode();
        if mode & 0o004 != 0 {
            warn!(
                path = %path.display(),
                mode = format!("{mode:04o}"),
                "{label} is world-readable, consider chmod 640 or stricter",
            );
        }
    }
}

#[cfg(not(unix))]
pub(super) fn warn_if_world_readable(_path: &Path, _label: &str) {}

/// Enforce a maximum count on a config collection.
pub(super) fn check_limit(field: &str, count: usize, max: usize) -> Result<(), ConfigError> {
    if count > max {
        return Err(validation(field, format!("count {count} exceeds maximum {max}")));
    }
    Ok(())
}
