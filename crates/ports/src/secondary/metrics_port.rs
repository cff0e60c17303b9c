// Focused sub-traits for recording Prometheus metrics, grouped by concern.
//
// All methods take `&self`; implementations use atomic metric types.
// Default implementations are no-ops so test mocks only implement what the
// service under test records.

// ── Registry metrics ───────────────────────────────────────────────

pub trait RegistryMetrics: Send + Sync {
    /// Set the number of registered virtual services.
    fn set_services(&self, _count: u64) {}

    /// Set the number of linked destinations across all services.
    fn set_destinations(&self, _count: u64) {}

    /// Set the number of destinations parked in the trash.
    fn set_trash_size(&self, _count: u64) {}

    /// Record destinations released by a delete, by outcome (freed/trashed).
    fn record_dests_released(&self, _outcome: &str, _count: u64) {}
}

// ── Defense metrics ────────────────────────────────────────────────

pub trait DefenseMetrics: Send + Sync {
    /// Set the configured level (0..=3) of a defense control.
    fn set_defense_level(&self, _control: &str, _level: u32) {}

    /// Set whether a defense control is engaged.
    fn set_defense_active(&self, _control: &str, _active: bool) {}

    /// Set the current packet drop interval (0 = not dropping).
    fn set_drop_rate(&self, _rate: u32) {}

    /// Set the available memory last observed by the defense tick, in pages.
    fn set_available_memory_pages(&self, _pages: u64) {}

    /// Record a failed memory probe.
    fn record_memory_probe_error(&self) {}
}

// ── Control channel metrics ────────────────────────────────────────

pub trait ControlMetrics: Send + Sync {
    /// Record a control request with command and result labels.
    fn record_control_request(&self, _command: &str, _result: &str) {}

    /// Observe control request handling time in seconds.
    fn observe_control_duration(&self, _command: &str, _duration_seconds: f64) {}
}

// ── Composite super-trait ──────────────────────────────────────────

/// Unified metrics port composing all sub-traits.
///
/// Services accept `Arc<dyn MetricsPort>`.
pub trait MetricsPort: RegistryMetrics + DefenseMetrics + ControlMetrics {}

/// Blanket implementation: any type implementing all sub-traits automatically
/// implements `MetricsPort`.
impl<T> MetricsPort for T where T: RegistryMetrics + DefenseMetrics + ControlMetrics {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_port_is_object_safe() {
        // Compile-time check: MetricsPort must be usable as dyn trait.
        fn _check(port: &dyn MetricsPort) {
            port.set_services(3);
            port.set_destinations(6);
            port.set_trash_size(1);
            port.record_dests_released("freed", 2);
            port.set_defense_level("drop_packet", 1);
            port.set_defense_active("drop_packet", true);
            port.set_drop_rate(42);
            port.set_available_memory_pages(1 << 20);
            port.record_memory_probe_error();
            port.record_control_request("add_service", "ok");
            port.observe_control_duration("add_service", 0.001);
        }
    }

    #[test]
    fn minimal_mock_compiles() {
        struct MinimalMock;
        impl RegistryMetrics for MinimalMock {}
        impl DefenseMetrics for MinimalMock {}
        impl ControlMetrics for MinimalMock {}

        let mock = MinimalMock;
        let port: &dyn MetricsPort = &mock;
        port.set_services(1);
    }
}
