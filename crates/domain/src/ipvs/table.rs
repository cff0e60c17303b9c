use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, PoisonError, RwLock};

use crate::common::entity::Protocol;
use crate::common::error::DomainError;

use super::arena::Arena;
use super::entity::{
    AddressKind, DestConfig, DestView, FTPDATA, FTPPORT, ForwardingMethod, PROT_SOCK,
    ServiceConfig, ServiceKey, ServiceView, classify_address,
};
use super::error::IpvsError;
use super::hash::{
    HashIndex, MARK_TAB_SIZE, RS_TAB_SIZE, TUPLE_TAB_SIZE, mark_hash, real_hash, tuple_hash,
};
use super::scheduler::SchedulerRegistry;
use super::service::{DestState, Destination, ServiceGuard, ServiceId, VirtualService};
use super::stats::Stats;

// ── Real-server index ─────────────────────────────────────────────────

/// Masquerade destinations keyed by address and port, for the NAT return
/// path. Holds no structural reference.
#[derive(Debug)]
pub struct RealServerIndex {
    index: HashIndex<Arc<Destination>>,
}

impl Default for RealServerIndex {
    fn default() -> Self {
        Self {
            index: HashIndex::new(RS_TAB_SIZE),
        }
    }
}

impl RealServerIndex {
    /// Find a real server. Mark-service destinations match any protocol.
    pub fn lookup(&self, protocol: Protocol, addr: Ipv4Addr, port: u16) -> Option<Arc<Destination>> {
        self.index
            .find(real_hash(addr, port), |d| {
                d.matches(addr, port)
                    && (d.service_key().protocol() == protocol || d.service_key().is_mark())
            })
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn insert(&mut self, dest: &Arc<Destination>) {
        self.index
            .insert(real_hash(dest.addr(), dest.port()), Arc::clone(dest));
        dest.set_in_rs_table(true);
    }

    fn remove(&mut self, dest: &Arc<Destination>) {
        self.index
            .remove(real_hash(dest.addr(), dest.port()), |d| Arc::ptr_eq(d, dest));
        dest.set_in_rs_table(false);
    }
}

/// What a delete or flush released.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Removal {
    pub services: usize,
    pub dests_freed: usize,
    pub dests_trashed: usize,
    /// Structural references still held on deleted services. Nonzero
    /// means a reference leaked.
    pub stray_refs: usize,
    /// Schedulers that refused to unbind from a deleted service. The
    /// service is deleted regardless.
    pub unbind_failures: Vec<(ServiceKey, String)>,
}

impl Removal {
    fn merge(&mut self, other: Self) {
        self.services += other.services;
        self.dests_freed += other.dests_freed;
        self.dests_trashed += other.dests_trashed;
        self.stray_refs += other.stray_refs;
        self.unbind_failures.extend(other.unbind_failures);
    }
}

// ── Service table ─────────────────────────────────────────────────────

/// Registry of virtual services and their destinations.
///
/// Structural changes take `&mut self` and run under the caller's write
/// lock; lookups take `&self` under a read lock and return a guard that
/// outlives it. Writers wait for outstanding guards on a service before
/// mutating it.
#[derive(Debug)]
pub struct ServiceTable {
    services: Arena<Arc<VirtualService>>,
    by_tuple: HashIndex<ServiceId>,
    by_mark: HashIndex<ServiceId>,
    /// Tuple services on the FTP control port.
    ftp_services: usize,
    /// Tuple services on port zero.
    wildcard_services: usize,
    trash: Vec<Arc<Destination>>,
    real_servers: Arc<RwLock<RealServerIndex>>,
    schedulers: SchedulerRegistry,
    local_addrs: HashSet<Ipv4Addr>,
    stats: Stats,
}

impl Default for ServiceTable {
    fn default() -> Self {
        Self::new(SchedulerRegistry::with_defaults())
    }
}

impl ServiceTable {
    pub fn new(schedulers: SchedulerRegistry) -> Self {
        Self {
            services: Arena::new(),
            by_tuple: HashIndex::new(TUPLE_TAB_SIZE),
            by_mark: HashIndex::new(MARK_TAB_SIZE),
            ftp_services: 0,
            wildcard_services: 0,
            trash: Vec::new(),
            real_servers: Arc::new(RwLock::new(RealServerIndex::default())),
            schedulers,
            local_addrs: HashSet::new(),
            stats: Stats::default(),
        }
    }

    /// Addresses owned by this host, in addition to loopback.
    pub fn set_local_addresses(&mut self, addrs: impl IntoIterator<Item = Ipv4Addr>) {
        self.local_addrs = addrs.into_iter().collect();
    }

    pub fn schedulers(&self) -> &SchedulerRegistry {
        &self.schedulers
    }

    pub fn schedulers_mut(&mut self) -> &mut SchedulerRegistry {
        &mut self.schedulers
    }

    /// Shared handle to the real-server index, which has its own lock.
    pub fn real_servers(&self) -> Arc<RwLock<RealServerIndex>> {
        Arc::clone(&self.real_servers)
    }

    pub fn num_services(&self) -> usize {
        self.services.len()
    }

    pub fn trash(&self) -> &[Arc<Destination>] {
        &self.trash
    }

    pub fn ftp_services(&self) -> usize {
        self.ftp_services
    }

    pub fn wildcard_services(&self) -> usize {
        self.wildcard_services
    }

    pub fn global_stats(&self) -> &Stats {
        &self.stats
    }

    // ── Lookup ────────────────────────────────────────────────────────

    /// Resolve a packet to a virtual service.
    ///
    /// Order: firewall mark, exact tuple, FTP data fallback to the control
    /// port, then the port-zero wildcard.
    pub fn lookup_service(
        &self,
        fwmark: u32,
        protocol: Protocol,
        addr: Ipv4Addr,
        port: u16,
    ) -> Option<ServiceGuard> {
        self.resolve(fwmark, protocol, addr, port)
            .map(VirtualService::acquire_use)
    }

    fn resolve(
        &self,
        fwmark: u32,
        protocol: Protocol,
        addr: Ipv4Addr,
        port: u16,
    ) -> Option<&Arc<VirtualService>> {
        if fwmark != 0 {
            if let Some(svc) = self.mark_get(fwmark) {
                return Some(svc);
            }
        }
        if let Some(svc) = self.tuple_get(protocol, addr, port) {
            return Some(svc);
        }
        // Approximation: any high port may be an FTP passive data channel.
        if protocol == Protocol::Tcp
            && self.ftp_services > 0
            && (port == FTPDATA || port >= PROT_SOCK)
        {
            if let Some(svc) = self.tuple_get(protocol, addr, FTPPORT) {
                return Some(svc);
            }
        }
        if self.wildcard_services > 0 {
            return self.tuple_get(protocol, addr, 0);
        }
        None
    }

    fn tuple_get(&self, protocol: Protocol, addr: Ipv4Addr, port: u16) -> Option<&Arc<VirtualService>> {
        let want = ServiceKey::tuple(protocol, addr, port);
        let id = self
            .by_tuple
            .find(tuple_hash(protocol.number(), addr, port), |id| {
                self.services.get(*id).is_some_and(|s| *s.key() == want)
            })?;
        self.services.get(*id)
    }

    fn mark_get(&self, fwmark: u32) -> Option<&Arc<VirtualService>> {
        let id = self.by_mark.find(mark_hash(fwmark), |id| {
            self.services
                .get(*id)
                .is_some_and(|s| s.key().fwmark() == fwmark)
        })?;
        self.services.get(*id)
    }

    /// Service occupying the identity of `key`, ignoring the protocol of
    /// mark services.
    fn occupant(&self, key: &ServiceKey) -> Option<&Arc<VirtualService>> {
        match *key {
            ServiceKey::Tuple {
                protocol,
                addr,
                port,
            } => self.tuple_get(protocol, addr, port),
            ServiceKey::Mark { fwmark, .. } => self.mark_get(fwmark),
        }
    }

    /// Administrative selector match: identity and protocol must agree.
    pub fn find(&self, key: &ServiceKey) -> Option<&Arc<VirtualService>> {
        self.occupant(key)
            .filter(|s| s.key().protocol() == key.protocol())
    }

    fn find_for_update(&self, key: &ServiceKey) -> Result<Arc<VirtualService>, IpvsError> {
        self.find(key)
            .cloned()
            .ok_or_else(|| IpvsError::ServiceNotFound {
                key: key.to_string(),
            })
    }

    /// Find a real server for the NAT return path.
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

    /// Services in table order: tuple table buckets, then mark table.
    pub fn services(&self) -> Vec<Arc<VirtualService>> {
        self.by_tuple
            .iter()
            .chain(self.by_mark.iter())
            .filter_map(|id| self.services.get(*id).cloned())
            .collect()
    }

    pub fn service_views(&self) -> Vec<ServiceView> {
        self.services().iter().map(|s| s.view()).collect()
    }

    pub fn get_service(&self, key: &ServiceKey) -> Result<ServiceView, DomainError> {
        Ok(self.find_for_update(key)?.view())
    }

    pub fn dest_views(&self, key: &ServiceKey) -> Result<Vec<DestView>, DomainError> {
        let svc = self.find_for_update(key)?;
        Ok(svc.destinations().iter().map(|d| d.view()).collect())
    }

    // ── Service operations ────────────────────────────────────────────

    pub fn add_service(&mut self, cfg: &ServiceConfig) -> Result<ServiceId, DomainError> {
        if let ServiceKey::Mark { fwmark: 0, .. } = cfg.key {
            return Err(IpvsError::InvalidSelector("firewall mark must be nonzero".into()).into());
        }
        if self.occupant(&cfg.key).is_some() {
            return Err(IpvsError::ServiceExists {
                key: cfg.key.to_string(),
            }
            .into());
        }

        self.services.reserve()?;
        let scheduler = self.schedulers.create(&cfg.scheduler)?;
        scheduler.bind(&cfg.key)?;

        let id = self
            .services
            .insert_with(|id| Arc::new(VirtualService::new(id, cfg, scheduler)))?;
        let svc = self
            .services
            .get(id)
            .cloned()
            .ok_or(IpvsError::OutOfMemory("service slot"))?;

        svc.stats().start_estimator();
        self.hash_service(&svc);
        if let ServiceKey::Tuple { port, .. } = cfg.key {
            if port == FTPPORT {
                self.ftp_services += 1;
            } else if port == 0 {
                self.wildcard_services += 1;
            }
        }
        Ok(id)
    }

    /// Update flags, timeout, netmask and possibly the scheduler.
    ///
    /// A scheduler that fails to bind leaves the service unchanged with its
    /// previous scheduler rebound.
    ///
    /// When the previous scheduler cannot be rebound either, the error is
    /// [`IpvsError::SchedulerRollback`] and the service keeps its previous,
    /// unbound scheduler.
    pub fn edit_service(&mut self, cfg: &ServiceConfig) -> Result<(), IpvsError> {
        let svc = self.find_for_update(&cfg.key)?;
        let replacement = if svc.scheduler_name() == cfg.scheduler {
            None
        } else {
            Some(self.schedulers.create(&cfg.scheduler)?)
        };

        svc.wait_quiescent();
        let mut state = svc.write_state();

        if let Some(next) = replacement {
            state.scheduler.unbind(svc.key())?;
            if let Err(e) = next.bind(svc.key()) {
                // Restore the previous binding; the caller sees the bind error.
                return Err(match state.scheduler.bind(svc.key()) {
                    Ok(()) => e,
                    Err(rollback) => IpvsError::SchedulerRollback {
                        previous: state.scheduler.name().to_string(),
                        source: Box::new(e),
                        rollback: Box::new(rollback),
                    },
                });
            }
            next.update_service(&state.destinations);
            state.scheduler = next;
        }

        state.flags = state.flags.replace_user_bits(cfg.flags);
        state.timeout = cfg.timeout;
        state.netmask = cfg.netmask;
        Ok(())
    }

    pub fn del_service(&mut self, key: &ServiceKey) -> Result<Removal, DomainError> {
        let svc = self.find_for_update(key)?;
        self.trash
            .try_reserve(svc.num_dests())
            .map_err(|_| IpvsError::OutOfMemory("trash"))?;
        self.unhash_service(&svc);
        Ok(self.teardown_service(&svc))
    }

    /// Delete every service in both tables.
    pub fn flush(&mut self) -> Result<Removal, DomainError> {
        let mut total = Removal::default();
        for svc in self.services() {
            self.trash
                .try_reserve(svc.num_dests())
                .map_err(|_| IpvsError::OutOfMemory("trash"))?;
            self.unhash_service(&svc);
            total.merge(self.teardown_service(&svc));
        }
        Ok(total)
    }

    fn hash_service(&mut self, svc: &Arc<VirtualService>) {
        match *svc.key() {
            ServiceKey::Tuple {
                protocol,
                addr,
                port,
            } => self
                .by_tuple
                .insert(tuple_hash(protocol.number(), addr, port), svc.id()),
            ServiceKey::Mark { fwmark, .. } => self.by_mark.insert(mark_hash(fwmark), svc.id()),
        }
        svc.acquire_structural();
        let mut state = svc.write_state();
        state.flags = state.flags.with_hashed(true);
    }

    fn unhash_service(&mut self, svc: &Arc<VirtualService>) {
        let id = svc.id();
        let removed = match *svc.key() {
            ServiceKey::Tuple {
                protocol,
                addr,
                port,
            } => self
                .by_tuple
                .remove(tuple_hash(protocol.number(), addr, port), |s| *s == id),
            ServiceKey::Mark { fwmark, .. } => {
                self.by_mark.remove(mark_hash(fwmark), |s| *s == id)
            }
        };
        if removed.is_some() {
            svc.release_structural();
            let mut state = svc.write_state();
            state.flags = state.flags.with_hashed(false);
        }
    }

    /// Tear down an unhashed service: drain lookups, delete destinations,
    /// unbind the scheduler and retire the slot.
    fn teardown_service(&mut self, svc: &Arc<VirtualService>) -> Removal {
        svc.wait_quiescent();

        let dests = {
            let mut state = svc.write_state();
            let dests = std::mem::take(&mut state.destinations);
            state.scheduler.update_service(&state.destinations);
            dests
        };

        let mut removal = Removal {
            services: 1,
            ..Removal::default()
        };
        for dest in dests {
            svc.release_structural();
            match self.retire_dest(dest) {
                DestState::Trashed => removal.dests_trashed += 1,
                _ => removal.dests_freed += 1,
            }
        }

        // A refusing scheduler does not keep the service alive.
        if let Err(e) = svc.read_state().scheduler.unbind(svc.key()) {
            removal.unbind_failures.push((*svc.key(), e.to_string()));
        }
        svc.stats().stop_estimator();

        if let ServiceKey::Tuple { port, .. } = *svc.key() {
            if port == FTPPORT {
                self.ftp_services -= 1;
            } else if port == 0 {
                self.wildcard_services -= 1;
            }
        }

        removal.stray_refs = svc.structural_refs();
        debug_assert_eq!(removal.stray_refs, 0, "service {} still referenced", svc.key());
        self.services.remove(svc.id());
        removal
    }

    // ── Destination operations ────────────────────────────────────────

    fn resolve_method(&self, cfg: &DestConfig) -> Result<ForwardingMethod, IpvsError> {
        cfg.validate()?;
        let kind = classify_address(cfg.addr, |a| self.local_addrs.contains(&a))?;
        Ok(match kind {
            AddressKind::Local => ForwardingMethod::LocalNode,
            AddressKind::Unicast => cfg.forwarding,
        })
    }

    pub fn add_dest(&mut self, key: &ServiceKey, cfg: &DestConfig) -> Result<(), DomainError> {
        let method = self.resolve_method(cfg)?;
        let svc = self.find_for_update(key)?;
        if svc.find_dest(cfg.addr, cfg.port).is_some() {
            return Err(IpvsError::DestExists {
                addr: format!("{}:{}", cfg.addr, cfg.port),
            }
            .into());
        }
        svc.write_state()
            .destinations
            .try_reserve(1)
            .map_err(|_| IpvsError::OutOfMemory("destination"))?;

        let dest = if let Some(revived) = self.take_from_trash(svc.key(), cfg.addr, cfg.port) {
            if revived.owner() != Some(svc.id()) {
                revived.stats().zero();
            }
            revived.set_state(DestState::Active);
            revived
        } else {
            Arc::new(Destination::new(*svc.key(), cfg))
        };

        dest.apply(cfg.weight, method);
        dest.stats().start_estimator();
        dest.set_owner(Some(svc.id()));
        dest.acquire_ref();
        svc.acquire_structural();
        self.sync_real_server(&dest, method);

        svc.wait_quiescent();
        let mut state = svc.write_state();
        state.destinations.push(dest);
        state.scheduler.update_service(&state.destinations);
        Ok(())
    }

    pub fn edit_dest(&mut self, key: &ServiceKey, cfg: &DestConfig) -> Result<(), DomainError> {
        let method = self.resolve_method(cfg)?;
        let svc = self.find_for_update(key)?;
        let dest = svc
            .find_dest(cfg.addr, cfg.port)
            .ok_or_else(|| IpvsError::DestNotFound {
                addr: format!("{}:{}", cfg.addr, cfg.port),
            })?;

        svc.wait_quiescent();
        let state = svc.write_state();
        dest.apply(cfg.weight, method);
        self.sync_real_server(&dest, method);
        state.scheduler.update_service(&state.destinations);
        Ok(())
    }

    pub fn del_dest(
        &mut self,
        key: &ServiceKey,
        addr: Ipv4Addr,
        port: u16,
    ) -> Result<Removal, DomainError> {
        let svc = self.find_for_update(key)?;
        let dest = svc
            .find_dest(addr, port)
            .ok_or_else(|| IpvsError::DestNotFound {
                addr: format!("{addr}:{port}"),
            })?;
        self.trash
            .try_reserve(1)
            .map_err(|_| IpvsError::OutOfMemory("trash"))?;

        svc.wait_quiescent();
        {
            let mut state = svc.write_state();
            state.destinations.retain(|d| !Arc::ptr_eq(d, &dest));
            state.scheduler.update_service(&state.destinations);
        }
        svc.release_structural();

        let mut removal = Removal::default();
        match self.retire_dest(dest) {
            DestState::Trashed => removal.dests_trashed = 1,
            _ => removal.dests_freed = 1,
        }
        Ok(removal)
    }

    /// Release an unlinked destination's list reference. It is freed when
    /// nothing else holds it, otherwise parked in the trash.
    fn retire_dest(&mut self, dest: Arc<Destination>) -> DestState {
        dest.stats().stop_estimator();
        if dest.in_real_server_table() {
            self.real_servers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&dest);
        }
        if dest.release_ref() == 0 {
            dest.set_state(DestState::Freed);
            DestState::Freed
        } else {
            dest.acquire_ref();
            dest.set_state(DestState::Trashed);
            self.trash.push(dest);
            DestState::Trashed
        }
    }

    /// Pull a trashed destination matching the service key and address.
    /// Unreferenced entries passed over on the way are freed.
    fn take_from_trash(
        &mut self,
        key: &ServiceKey,
        addr: Ipv4Addr,
        port: u16,
    ) -> Option<Arc<Destination>> {
        let mut found = None;
        self.trash.retain(|d| {
            if found.is_none() && d.service_key() == key && d.matches(addr, port) {
                found = Some(Arc::clone(d));
                return false;
            }
            if d.structural_refs() == 1 {
                d.release_ref();
                d.set_state(DestState::Freed);
                return false;
            }
            true
        });
        if let Some(d) = &found {
            d.release_ref();
        }
        found
    }

    fn sync_real_server(&self, dest: &Arc<Destination>, method: ForwardingMethod) {
        let masq = method == ForwardingMethod::Masquerade;
        if masq == dest.in_real_server_table() {
            return;
        }
        let mut rs = self
            .real_servers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if masq {
            rs.insert(dest);
        } else {
            rs.remove(dest);
        }
    }

    // ── Statistics ────────────────────────────────────────────────────

    /// Zero one service and its destinations, or everything plus the
    /// global counters when `key` is `None`.
    pub fn zero(&mut self, key: Option<&ServiceKey>) -> Result<(), DomainError> {
        let targets = match key {
            Some(k) => vec![self.find_for_update(k)?],
            None => {
                self.stats.zero();
                self.services()
            }
        };
        for svc in targets {
            svc.stats().zero();
            for d in svc.destinations() {
                d.stats().zero();
            }
        }
        Ok(())
    }

    /// Check reference-count invariants across the registry.
    pub fn verify(&self) -> Result<(), String> {
        let hashed = self.by_tuple.len() + self.by_mark.len();
        if hashed != self.services.len() {
            return Err(format!(
                "{hashed} hashed entries for {} services",
                self.services.len()
            ));
        }
        for (_, svc) in self.services.iter() {
            let dests = svc.destinations();
            let want = 1 + dests.len();
            if svc.structural_refs() != want {
                return Err(format!(
                    "service {} holds {} refs, expected {want}",
                    svc.key(),
                    svc.structural_refs()
                ));
            }
            for d in &dests {
                let conns = (d.active_conns() + d.inactive_conns()) as usize;
                if d.structural_refs() != 1 + conns {
                    return Err(format!(
                        "destination {}:{} holds {} refs with {conns} connections",
                        d.addr(),
                        d.port(),
                        d.structural_refs()
                    ));
                }
                if d.state() != DestState::Active {
                    return Err(format!("linked destination {}:{} not active", d.addr(), d.port()));
                }
            }
        }
        for d in &self.trash {
            let conns = (d.active_conns() + d.inactive_conns()) as usize;
            if d.structural_refs() != 1 + conns || d.state() != DestState::Trashed {
                return Err(format!(
                    "trashed destination {}:{} holds {} refs with {conns} connections",
                    d.addr(),
                    d.port(),
                    d.structural_refs()
                ));
            }
        }
        Ok(())
    }
}
