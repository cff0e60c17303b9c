use std::net::Ipv4Addr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use domain::common::entity::Protocol;
use domain::common::error::DomainError;
use domain::ipvs::entity::{DestConfig, DestView, ServiceConfig, ServiceKey, ServiceView};
use domain::ipvs::error::IpvsError;
use domain::ipvs::service::{Destination, ServiceGuard};
use domain::ipvs::stats::StatsSnapshot;
use domain::ipvs::table::{RealServerIndex, Removal, ServiceTable};
use ports::secondary::metrics_port::MetricsPort;

/// Application-level virtual service registry.
///
/// Owns the registry lock: structural changes take it for writing, packet
/// lookups take it for reading only long enough to acquire a guard. The
/// real-server table sits behind its own lock so the NAT return path never
/// touches the registry lock.
pub struct IpvsAppService {
    table: RwLock<ServiceTable>,
    real_servers: Arc<RwLock<RealServerIndex>>,
    metrics: Arc<dyn MetricsPort>,
}

impl IpvsAppService {
    pub fn new(table: ServiceTable, metrics: Arc<dyn MetricsPort>) -> Self {
        let real_servers = table.real_servers();
        Self {
            table: RwLock::new(table),
            real_servers,
            metrics,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, ServiceTable> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ServiceTable> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Packet path ───────────────────────────────────────────────

    pub fn lookup_service(
        &self,
        fwmark: u32,
        protocol: Protocol,
        addr: Ipv4Addr,
        port: u16,
    ) -> Option<ServiceGuard> {
        self.read().lookup_service(fwmark, protocol, addr, port)
    }

    pub fn lookup_real_server(
        &self,
        protocol: Protocol,
        addr: Ipv4Addr,
        port: u16,
    ) -> Option<Arc<Destination>> {
        self.real_servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .lookup(protocol, addr, port)
    }

    // ── Queries ───────────────────────────────────────────────────

    pub fn num_services(&self) -> usize {
        self.read().num_services()
    }

    /// Up to `limit` services in table order.
    pub fn services(&self, limit: usize) -> Vec<ServiceView> {
        let table = self.read();
        table
            .services()
            .iter()
            .take(limit)
            .map(|s| s.view())
            .collect()
    }

    pub fn get_service(&self, key: &ServiceKey) -> Result<ServiceView, DomainError> {
        self.read().get_service(key)
    }

    /// Up to `limit` destinations of one service.
    pub fn dests(&self, key: &ServiceKey, limit: usize) -> Result<Vec<DestView>, DomainError> {
        let mut dests = self.read().dest_views(key)?;
        dests.truncate(limit);
        Ok(dests)
    }

    pub fn global_stats(&self) -> StatsSnapshot {
        self.read().global_stats().snapshot()
    }

    pub fn scheduler_names(&self) -> Vec<String> {
        self.read()
            .schedulers()
            .names()
            .into_iter()
            .map(str::to_owned)
            .collect()
    }

    pub fn trash_size(&self) -> usize {
        self.read().trash().len()
    }

    /// Check registry reference invariants.
    pub fn verify(&self) -> Result<(), String> {
        self.read().verify()
    }

    // ── Mutations ─────────────────────────────────────────────────

    pub fn set_local_addresses(&self, addrs: impl IntoIterator<Item = Ipv4Addr>) {
        self.write().set_local_addresses(addrs);
    }

    pub fn add_service(&self, cfg: &ServiceConfig) -> Result<(), DomainError> {
        let mut table = self.write();
        table.add_service(cfg)?;
        tracing::info!(
            service = %cfg.key,
            scheduler = %cfg.scheduler,
            flags = cfg.flags.bits(),
            timeout = cfg.timeout,
            "virtual service added"
        );
        self.update_metrics(&table);
        Ok(())
    }

    pub fn edit_service(&self, cfg: &ServiceConfig) -> Result<(), DomainError> {
        let mut table = self.write();
        if let Err(e) = table.edit_service(cfg) {
            if let IpvsError::SchedulerRollback { previous, .. } = &e {
                tracing::error!(
                    service = %cfg.key,
                    scheduler = %previous,
                    error = %e,
                    "scheduler rollback failed, service left unbound"
                );
            }
            return Err(e.into());
        }
        tracing::info!(
            service = %cfg.key,
            scheduler = %cfg.scheduler,
            flags = cfg.flags.bits(),
            timeout = cfg.timeout,
            "virtual service edited"
        );
        Ok(())
    }

    pub fn del_service(&self, key: &ServiceKey) -> Result<(), DomainError> {
        let mut table = self.write();
        let removal = table.del_service(key)?;
        tracing::info!(
            service = %key,
            dests_freed = removal.dests_freed,
            dests_trashed = removal.dests_trashed,
            "virtual service deleted"
        );
        self.after_removal(&table, &removal);
        Ok(())
    }

    pub fn flush(&self) -> Result<(), DomainError> {
        let mut table = self.write();
        let removal = table.flush()?;
        tracing::info!(
            services = removal.services,
            dests_freed = removal.dests_freed,
            dests_trashed = removal.dests_trashed,
            "virtual services flushed"
        );
        self.after_removal(&table, &removal);
        Ok(())
    }

    pub fn add_dest(&self, key: &ServiceKey, cfg: &DestConfig) -> Result<(), DomainError> {
        let mut table = self.write();
        table.add_dest(key, cfg)?;
        tracing::info!(
            service = %key,
            dest = %cfg.addr,
            port = cfg.port,
            weight = cfg.weight,
            forwarding = cfg.forwarding.as_str(),
            "destination added"
        );
        self.update_metrics(&table);
        Ok(())
    }

    pub fn edit_dest(&self, key: &ServiceKey, cfg: &DestConfig) -> Result<(), DomainError> {
        let mut table = self.write();
        table.edit_dest(key, cfg)?;
        tracing::info!(
            service = %key,
            dest = %cfg.addr,
            port = cfg.port,
            weight = cfg.weight,
            forwarding = cfg.forwarding.as_str(),
            "destination edited"
        );
        Ok(())
    }

    pub fn del_dest(&self, key: &ServiceKey, addr: Ipv4Addr, port: u16) -> Result<(), DomainError> {
        let mut table = self.write();
        let removal = table.del_dest(key, addr, port)?;
        tracing::info!(
            service = %key,
            dest = %addr,
            port,
            trashed = removal.dests_trashed > 0,
            "destination deleted"
        );
        self.after_removal(&table, &removal);
        Ok(())
    }

    /// Zero one service's counters, or all counters when `key` is `None`.
    pub fn zero(&self, key: Option<&ServiceKey>) -> Result<(), DomainError> {
        self.write().zero(key)?;
        match key {
            Some(k) => tracing::debug!(service = %k, "statistics zeroed"),
            None => tracing::debug!("all statistics zeroed"),
        }
        Ok(())
    }

    fn after_removal(&self, table: &ServiceTable, removal: &Removal) {
        if removal.stray_refs > 0 {
            tracing::error!(
                stray_refs = removal.stray_refs,
                "deleted service still referenced"
            );
        }
        for (service, error) in &removal.unbind_failures {
            tracing::error!(service = %service, error = %error, "scheduler unbind failed");
        }
        if removal.dests_freed > 0 {
            self.metrics
                .record_dests_released("freed", removal.dests_freed as u64);
        }
        if removal.dests_trashed > 0 {
            self.metrics
                .record_dests_released("trashed", removal.dests_trashed as u64);
        }
        self.update_metrics(table);
    }

    fn update_metrics(&self, table: &ServiceTable) {
        let services = table.services();
        let dests: usize = services.iter().map(|s| s.num_dests()).sum();
        self.metrics.set_services(services.len() as u64);
        self.metrics.set_destinations(dests as u64);
        self.metrics.set_trash_size(table.trash().len() as u64);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use ports::secondary::metrics_port::{ControlMetrics, DefenseMetrics, RegistryMetrics};
    use domain::ipvs::scheduler::Scheduler;
    use ports::test_utils::NoopMetrics;

    const VIP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    fn web() -> ServiceKey {
        ServiceKey::tuple(Protocol::Tcp, VIP, 80)
    }

    fn make_service() -> IpvsAppService {
        IpvsAppService::new(ServiceTable::default(), Arc::new(NoopMetrics))
    }

    #[derive(Default)]
    struct GaugeMetrics {
        services: AtomicU64,
        dests: AtomicU64,
        trash: AtomicU64,
        freed: AtomicU64,
    }

    impl RegistryMetrics for GaugeMetrics {
        fn set_services(&self, count: u64) {
            self.services.store(count, Ordering::Relaxed);
        }
        fn set_destinations(&self, count: u64) {
            self.dests.store(count, Ordering::Relaxed);
        }
        fn set_trash_size(&self, count: u64) {
            self.trash.store(count, Ordering::Relaxed);
        }
        fn record_dests_released(&self, outcome: &str, count: u64) {
            if outcome == "freed" {
                self.freed.fetch_add(count, Ordering::Relaxed);
            }
        }
    }
    impl DefenseMetrics for GaugeMetrics {}
    impl ControlMetrics for GaugeMetrics {}

    #[test]
    fn add_and_list() {
        let svc = make_service();
        svc.add_service(&ServiceConfig::new(web())).unwrap();
        svc.add_dest(&web(), &DestConfig::new(Ipv4Addr::new(10, 0, 1, 1), 8080))
            .unwrap();
        let listed = svc.services(10);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].num_dests, 1);
        assert_eq!(svc.dests(&web(), 10).unwrap().len(), 1);
        assert_eq!(svc.dests(&web(), 0).unwrap().len(), 0);
        svc.verify().unwrap();
    }

    #[test]
    fn services_respects_limit() {
        let svc = make_service();
        for port in 1..=5 {
            svc.add_service(&ServiceConfig::new(ServiceKey::tuple(Protocol::Tcp, VIP, port)))
                .unwrap();
        }
        assert_eq!(svc.services(3).len(), 3);
        assert_eq!(svc.num_services(), 5);
    }

    #[test]
    fn lookup_and_real_server_paths() {
        let svc = make_service();
        svc.add_service(&ServiceConfig::new(web())).unwrap();
        let rs = Ipv4Addr::new(10, 0, 1, 1);
        svc.add_dest(&web(), &DestConfig::new(rs, 8080)).unwrap();

        let guard = svc.lookup_service(0, Protocol::Tcp, VIP, 80).unwrap();
        assert_eq!(guard.schedule().unwrap().addr(), rs);
        drop(guard);
        assert!(svc.lookup_real_server(Protocol::Tcp, rs, 8080).is_some());

        svc.del_dest(&web(), rs, 8080).unwrap();
        assert!(svc.lookup_real_server(Protocol::Tcp, rs, 8080).is_none());
    }

    #[test]
    fn metrics_follow_mutations() {
        let metrics = Arc::new(GaugeMetrics::default());
        let svc = IpvsAppService::new(ServiceTable::default(), metrics.clone());
        svc.add_service(&ServiceConfig::new(web())).unwrap();
        svc.add_dest(&web(), &DestConfig::new(Ipv4Addr::new(10, 0, 1, 1), 80))
            .unwrap();
        svc.add_dest(&web(), &DestConfig::new(Ipv4Addr::new(10, 0, 1, 2), 80))
            .unwrap();
        assert_eq!(metrics.services.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.dests.load(Ordering::Relaxed), 2);

        svc.flush().unwrap();
        assert_eq!(metrics.services.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.dests.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.freed.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.trash.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn errors_propagate() {
        let svc = make_service();
        assert!(matches!(
            svc.del_service(&web()),
            Err(DomainError::NotFound(_))
        ));
        svc.add_service(&ServiceConfig::new(web())).unwrap();
        assert!(matches!(
            svc.add_service(&ServiceConfig::new(web())),
            Err(DomainError::AlreadyExists(_))
        ));
    }

    #[derive(Debug)]
    struct RefusesUnbind;

    impl Scheduler for RefusesUnbind {
        fn name(&self) -> &str {
            "stubborn"
        }

        fn unbind(&self, _service: &ServiceKey) -> Result<(), IpvsError> {
            Err(IpvsError::SchedulerBind {
                name: "stubborn".to_string(),
                reason: "busy".to_string(),
            })
        }

        fn schedule(&self, dests: &[Arc<Destination>]) -> Option<Arc<Destination>> {
            dests.first().cloned()
        }
    }

    fn make_stubborn_service() -> IpvsAppService {
        let mut table = ServiceTable::default();
        table
            .schedulers_mut()
            .register(
                "stubborn",
                Arc::new(|| -> Box<dyn Scheduler> { Box::new(RefusesUnbind) }),
            )
            .unwrap();
        IpvsAppService::new(table, Arc::new(NoopMetrics))
    }

    #[test]
    fn refused_unbind_still_deletes_service() {
        let svc = make_stubborn_service();
        svc.add_service(&ServiceConfig::new(web()).with_scheduler("stubborn"))
            .unwrap();
        svc.del_service(&web()).unwrap();
        assert_eq!(svc.num_services(), 0);
        svc.verify().unwrap();
    }

    #[test]
    fn scheduler_edit_errors_map_to_invalid_argument() {
        let svc = make_stubborn_service();
        svc.add_service(&ServiceConfig::new(web())).unwrap();
        svc.edit_service(&ServiceConfig::new(web()).with_scheduler("stubborn"))
            .unwrap();
        // Leaving "stubborn" is refused before any rebinding.
        assert!(matches!(
            svc.edit_service(&ServiceConfig::new(web())),
            Err(DomainError::InvalidArgument(_))
        ));
        assert_eq!(svc.services(1)[0].scheduler, "stubborn");
    }

    #[test]
    fn zero_all_resets_global_stats() {
        let svc = make_service();
        svc.zero(None).unwrap();
        assert_eq!(svc.global_stats(), StatsSnapshot::default());
        assert_eq!(svc.scheduler_names(), vec!["rr".to_string()]);
    }
}
