use std::time::Duration;

// ── Paths ──────────────────────────────────────────────────────────

pub const DEFAULT_CONFIG_PATH: &str = "/etc/ipvs-sentinel/config.yaml";
pub const DEFAULT_CONTROL_SOCKET: &str = "/run/ipvs-sentinel/control.sock";
pub const PROC_MEMINFO: &str = "/proc/meminfo";

// ── Network defaults ───────────────────────────────────────────────

pub const DEFAULT_HTTP_PORT: u16 = 9090;

// ── Registry sizing ────────────────────────────────────────────────

/// Connection table size reported by `GetInfo` is `1 << bits`.
pub const DEFAULT_CONN_TAB_BITS: u8 = 12;
pub const MIN_CONN_TAB_BITS: u8 = 8;
pub const MAX_CONN_TAB_BITS: u8 = 20;

/// Memory is accounted in pages of this size.
pub const PAGE_SIZE: u64 = 4096;

// ── Timeouts ───────────────────────────────────────────────────────

pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for reading one control request off an accepted connection.
pub const CONTROL_READ_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_DEFENSE_TICK: Duration = Duration::from_secs(1);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_tab_bits_in_range() {
        assert!(MIN_CONN_TAB_BITS <= DEFAULT_CONN_TAB_BITS);
        assert!(DEFAULT_CONN_TAB_BITS <= MAX_CONN_TAB_BITS);
        assert_eq!(1u32 << DEFAULT_CONN_TAB_BITS, 4096);
    }

    #[test]
    fn shutdown_timeout_is_reasonable() {
        assert!(GRACEFUL_SHUTDOWN_TIMEOUT.as_secs() >= 1);
        assert!(GRACEFUL_SHUTDOWN_TIMEOUT.as_secs() <= 30);
    }

    #[test]
    fn defense_ticks_at_least_once_per_second() {
        assert!(DEFAULT_DEFENSE_TICK <= Duration::from_secs(1));
    }
}
