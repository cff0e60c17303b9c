use std::sync::atomic::AtomicU64;

use ports::secondary::metrics_port::{ControlMetrics, DefenseMetrics, RegistryMetrics};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets_range};
use prometheus_client::registry::Registry;

// ── Label types ─────────────────────────────────────────────────────

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ControlLabels {
    pub control: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CommandLabels {
    pub command: String,
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CommandNameLabels {
    pub command: String,
}

// ── Agent metrics registry ──────────────────────────────────────────

/// Prometheus metrics registry for the agent.
///
/// Metric families are atomics, so recording only needs `&self`. Wrap in
/// `Arc` to share between the control server, the defense loop and HTTP.
pub struct AgentMetrics {
    registry: Registry,
    pub services: Gauge,
    pub destinations: Gauge,
    pub trash_size: Gauge,
    pub dests_released_total: Family<OutcomeLabels, Counter>,
    pub defense_level: Family<ControlLabels, Gauge>,
    pub defense_active: Family<ControlLabels, Gauge>,
    pub drop_rate: Gauge,
    pub available_memory_pages: Gauge,
    pub memory_probe_errors_total: Counter,
    pub control_requests_total: Family<CommandLabels, Counter>,
    pub control_duration: Family<CommandNameLabels, Histogram>,
    pub drop_probability: Gauge<f64, AtomicU64>,
}

impl AgentMetrics {
    /// Create a registry with every metric under the `ipvs_sentinel` prefix.
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("ipvs_sentinel");

        let services = Gauge::default();
        registry.register("services", "Registered virtual services", services.clone());

        let destinations = Gauge::default();
        registry.register(
            "destinations",
            "Destinations linked to a virtual service",
            destinations.clone(),
        );

        let trash_size = Gauge::default();
        registry.register(
            "trash_size",
            "Unlinked destinations kept alive by connections",
            trash_size.clone(),
        );

        let dests_released_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "dests_released",
            "Destinations released by deletes, by outcome",
            dests_released_total.clone(),
        );

        let defense_level = Family::<ControlLabels, Gauge>::default();
        registry.register(
            "defense_level",
            "Configured defense level per control (0-3)",
            defense_level.clone(),
        );

        let defense_active = Family::<ControlLabels, Gauge>::default();
        registry.register(
            "defense_active",
            "Whether a defense control is engaged (1=on)",
            defense_active.clone(),
        );

        let drop_rate = Gauge::default();
        registry.register(
            "drop_rate",
            "Packet drop interval, one in N (0=not dropping)",
            drop_rate.clone(),
        );

        let available_memory_pages = Gauge::default();
        registry.register(
            "available_memory_pages",
            "Available memory observed by the last defense tick",
            available_memory_pages.clone(),
        );

        let memory_probe_errors_total = Counter::default();
        registry.register(
            "memory_probe_errors",
            "Failed available-memory probes",
            memory_probe_errors_total.clone(),
        );

        let control_requests_total = Family::<CommandLabels, Counter>::default();
        registry.register(
            "control_requests",
            "Control channel requests by command and result",
            control_requests_total.clone(),
        );

        let control_duration = Family::<CommandNameLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets_range(0.000_01, 1.0, 12))
        });
        registry.register(
            "control_duration_seconds",
            "Control request handling time",
            control_duration.clone(),
        );

        let drop_probability = Gauge::<f64, AtomicU64>::default();
        registry.register(
            "drop_probability",
            "Fraction of new-connection packets dropped (1/drop_rate)",
            drop_probability.clone(),
        );

        Self {
            registry,
            services,
            destinations,
            trash_size,
            dests_released_total,
            defense_level,
            defense_active,
            drop_rate,
            available_memory_pages,
            memory_probe_errors_total,
            control_requests_total,
            control_duration,
            drop_probability,
        }
    }

    /// Encode all registered metrics to `OpenMetrics` text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = prometheus_client::encoding::text::encode(&mut buffer, &self.registry) {
            tracing::error!(error = %e, "metrics encoding failed");
        }
        buffer
    }
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn gauge_value(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

// ── Sub-trait implementations ──────────────────────────────────────

impl RegistryMetrics for AgentMetrics {
    fn set_services(&self, count: u64) {
        self.services.set(gauge_value(count));
    }

    fn set_destinations(&self, count: u64) {
        self.destinations.set(gauge_value(count));
    }

    fn set_trash_size(&self, count: u64) {
        self.trash_size.set(gauge_value(count));
    }

    fn record_dests_released(&self, outcome: &str, count: u64) {
        self.dests_released_total
            .get_or_create(&OutcomeLabels {
                outcome: outcome.to_string(),
            })
            .inc_by(count);
    }
}

impl DefenseMetrics for AgentMetrics {
    fn set_defense_level(&self, control: &str, level: u32) {
        self.defense_level
            .get_or_create(&ControlLabels {
                control: control.to_string(),
            })
            .set(i64::from(level));
    }

    fn set_defense_active(&self, control: &str, active: bool) {
        self.defense_active
            .get_or_create(&ControlLabels {
                control: control.to_string(),
            })
            .set(i64::from(active));
    }

    fn set_drop_rate(&self, rate: u32) {
        self.drop_rate.set(i64::from(rate));
        let probability = if rate == 0 { 0.0 } else { 1.0 / f64::from(rate) };
        self.drop_probability.set(probability);
    }

    fn set_available_memory_pages(&self, pages: u64) {
        self.available_memory_pages.set(gauge_value(pages));
    }

    fn record_memory_probe_error(&self) {
        self.memory_probe_errors_total.inc();
    }
}

impl ControlMetrics for AgentMetrics {
    fn record_control_request(&self, command: &str, result: &str) {
        self.control_requests_total
            .get_or_create(&CommandLabels {
                command: command.to_string(),
                result: result.to_string(),
            })
            .inc();
    }

    fn observe_control_duration(&self, command: &str, duration_seconds: f64) {
        self.control_duration
            .get_or_create(&CommandNameLabels {
                command: command.to_string(),
            })
            .observe(duration_seconds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ports::secondary::metrics_port::MetricsPort;

    #[test]
    fn new_creates_valid_registry() {
        let metrics = AgentMetrics::new();
        let encoded = metrics.encode();
        assert!(encoded.contains("# EOF"));
    }

    #[test]
    fn registry_gauges_appear_in_output() {
        let metrics = AgentMetrics::new();
        metrics.set_services(3);
        metrics.set_trash_size(1);

        let encoded = metrics.encode();
        assert!(encoded.contains("ipvs_sentinel_services 3"));
        assert!(encoded.contains("ipvs_sentinel_trash_size 1"));
    }

    #[test]
    fn released_dests_counted_by_outcome() {
        let metrics = AgentMetrics::new();
        metrics.record_dests_released("freed", 2);
        metrics.record_dests_released("trashed", 1);

        let encoded = metrics.encode();
        assert!(encoded.contains("ipvs_sentinel_dests_released_total{outcome=\"freed\"} 2"));
        assert!(encoded.contains("outcome=\"trashed\""));
    }

    #[test]
    fn defense_gauges_carry_control_label() {
        let metrics = AgentMetrics::new();
        metrics.set_defense_level("drop_packet", 1);
        metrics.set_defense_active("drop_packet", true);

        let encoded = metrics.encode();
        assert!(encoded.contains("ipvs_sentinel_defense_level{control=\"drop_packet\"} 1"));
        assert!(encoded.contains("ipvs_sentinel_defense_active{control=\"drop_packet\"} 1"));
    }

    #[test]
    fn drop_rate_sets_probability() {
        let metrics = AgentMetrics::new();
        metrics.set_drop_rate(4);
        assert_eq!(metrics.drop_rate.get(), 4);
        assert!((metrics.drop_probability.get() - 0.25).abs() < f64::EPSILON);

        metrics.set_drop_rate(0);
        assert!(metrics.drop_probability.get().abs() < f64::EPSILON);
    }

    #[test]
    fn control_requests_labelled() {
        let metrics = AgentMetrics::new();
        metrics.record_control_request("add_service", "ok");
        metrics.record_control_request("add_service", "already_exists");
        metrics.observe_control_duration("add_service", 0.000_2);

        let encoded = metrics.encode();
        assert!(encoded.contains("command=\"add_service\",result=\"ok\""));
        assert!(encoded.contains("ipvs_sentinel_control_duration_seconds"));
    }

    #[test]
    fn metrics_port_trait_impl() {
        let metrics = AgentMetrics::new();
        let port: &dyn MetricsPort = &metrics;
        port.set_destinations(6);
        port.set_available_memory_pages(1 << 20);
        port.record_memory_probe_error();
        assert_eq!(metrics.destinations.get(), 6);
        assert_eq!(metrics.available_memory_pages.get(), 1 << 20);
        assert_eq!(metrics.memory_probe_errors_total.get(), 1);
    }
}
