use std::net::Ipv4Addr;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU32, AtomicUsize, Ordering};
use std::sync::{
    Arc, Condvar, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use crate::ipvs::arena::SlotId;
use crate::ipvs::entity::{
    DestConfig, DestView, ForwardingMethod, ServiceConfig, ServiceFlags, ServiceKey, ServiceView,
    destination_conn_flags,
};
use crate::ipvs::scheduler::Scheduler;
use crate::ipvs::stats::Stats;

pub type ServiceId = SlotId;

// ── In-flight use counter ─────────────────────────────────────────────

/// Borrowed uses of a service by in-progress lookups.
///
/// Starts at one for the registry's own reference. Writers block in
/// [`VirtualService::wait_quiescent`] until it drains back to one.
#[derive(Debug)]
struct InflightUses {
    count: AtomicUsize,
    lock: Mutex<()>,
    drained: Condvar,
}

impl InflightUses {
    fn new() -> Self {
        Self {
            count: AtomicUsize::new(1),
            lock: Mutex::new(()),
            drained: Condvar::new(),
        }
    }

    fn acquire(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 2 {
            // Taking the lock orders this notify after any waiter's check.
            let _held = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.drained.notify_all();
        }
    }

    fn load(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

// ── Virtual service ───────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) struct ServiceState {
    pub(crate) flags: ServiceFlags,
    pub(crate) timeout: u32,
    pub(crate) netmask: Ipv4Addr,
    pub(crate) scheduler: Box<dyn Scheduler>,
    pub(crate) destinations: Vec<Arc<Destination>>,
}

/// A load-balanced virtual service and its ordered destination list.
#[derive(Debug)]
pub struct VirtualService {
    id: ServiceId,
    key: ServiceKey,
    /// Hash table membership plus one per linked destination back-pointer.
    structural_refs: AtomicUsize,
    inflight: InflightUses,
    state: RwLock<ServiceState>,
    stats: Stats,
}

impl VirtualService {
    pub(crate) fn new(id: ServiceId, cfg: &ServiceConfig, scheduler: Box<dyn Scheduler>) -> Self {
        Self {
            id,
            key: cfg.key,
            structural_refs: AtomicUsize::new(0),
            inflight: InflightUses::new(),
            state: RwLock::new(ServiceState {
                flags: cfg.flags,
                timeout: cfg.timeout,
                netmask: cfg.netmask,
                scheduler,
                destinations: Vec::new(),
            }),
            stats: Stats::default(),
        }
    }

    pub fn id(&self) -> ServiceId {
        self.id
    }

    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    pub fn flags(&self) -> ServiceFlags {
        self.read_state().flags
    }

    pub fn timeout(&self) -> u32 {
        self.read_state().timeout
    }

    pub fn netmask(&self) -> Ipv4Addr {
        self.read_state().netmask
    }

    pub fn scheduler_name(&self) -> String {
        self.read_state().scheduler.name().to_string()
    }

    pub fn num_dests(&self) -> usize {
        self.read_state().destinations.len()
    }

    pub fn destinations(&self) -> Vec<Arc<Destination>> {
        self.read_state().destinations.clone()
    }

    pub fn find_dest(&self, addr: Ipv4Addr, port: u16) -> Option<Arc<Destination>> {
        self.read_state()
            .destinations
            .iter()
            .find(|d| d.addr == addr && d.port == port)
            .cloned()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn structural_refs(&self) -> usize {
        self.structural_refs.load(Ordering::Acquire)
    }

    /// Current in-flight uses, including the registry's own.
    pub fn inflight_uses(&self) -> usize {
        self.inflight.load()
    }

    /// Ask the bound scheduler for a destination.
    pub fn schedule(&self) -> Option<Arc<Destination>> {
        let state = self.read_state();
        state.scheduler.schedule(&state.destinations)
    }

    pub fn view(&self) -> ServiceView {
        let state = self.read_state();
        ServiceView {
            key: self.key,
            scheduler: state.scheduler.name().to_string(),
            flags: state.flags,
            timeout: state.timeout,
            netmask: state.netmask,
            num_dests: state.destinations.len(),
            stats: self.stats.snapshot(),
        }
    }

    pub(crate) fn read_state(&self) -> RwLockReadGuard<'_, ServiceState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write_state(&self) -> RwLockWriteGuard<'_, ServiceState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn acquire_structural(&self) {
        self.structural_refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one structural reference and return the remainder.
    pub(crate) fn release_structural(&self) -> usize {
        self.structural_refs.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Borrow the service for the duration of a lookup.
    pub(crate) fn acquire_use(self: &Arc<Self>) -> ServiceGuard {
        self.inflight.acquire();
        ServiceGuard {
            service: Arc::clone(self),
        }
    }

    /// Block until every lookup that borrowed this service has released it.
    ///
    /// The caller holds the registry write lock, so no new lookup can start.
    pub(crate) fn wait_quiescent(&self) {
        let mut held = self
            .inflight
            .lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while self.inflight.load() > 1 {
            held = self
                .inflight
                .drained
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// A lookup's borrowed hold on a service. Dropping it releases the use.
#[derive(Debug)]
pub struct ServiceGuard {
    service: Arc<VirtualService>,
}

impl Deref for ServiceGuard {
    type Target = VirtualService;

    fn deref(&self) -> &Self::Target {
        &self.service
    }
}

impl Drop for ServiceGuard {
    fn drop(&mut self) {
        self.service.inflight.release();
    }
}

// ── Destination ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestState {
    Active,
    Trashed,
    Freed,
}

impl DestState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Active,
            1 => Self::Trashed,
            _ => Self::Freed,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Active => 0,
            Self::Trashed => 1,
            Self::Freed => 2,
        }
    }
}

/// A real server behind a virtual service.
///
/// The owning service's key is copied in so a destination left in the trash
/// can be matched and revived by a later service with the same key.
#[derive(Debug)]
pub struct Destination {
    addr: Ipv4Addr,
    port: u16,
    service_key: ServiceKey,
    /// Last owning service. Left in place while trashed; a stale handle
    /// no longer resolves in the registry.
    owner: Mutex<Option<ServiceId>>,
    weight: AtomicI32,
    conn_flags: AtomicU32,
    active_conns: AtomicU32,
    inactive_conns: AtomicU32,
    /// List membership, trash membership, and one per bound connection.
    structural_refs: AtomicUsize,
    in_rs_table: AtomicBool,
    state: AtomicU8,
    stats: Stats,
}

impl Destination {
    pub fn new(service_key: ServiceKey, cfg: &DestConfig) -> Self {
        Self {
            addr: cfg.addr,
            port: cfg.port,
            service_key,
            owner: Mutex::new(None),
            weight: AtomicI32::new(cfg.weight),
            conn_flags: AtomicU32::new(destination_conn_flags(cfg.forwarding)),
            active_conns: AtomicU32::new(0),
            inactive_conns: AtomicU32::new(0),
            structural_refs: AtomicUsize::new(0),
            in_rs_table: AtomicBool::new(false),
            state: AtomicU8::new(DestState::Active.to_u8()),
            stats: Stats::default(),
        }
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn service_key(&self) -> &ServiceKey {
        &self.service_key
    }

    pub fn owner(&self) -> Option<ServiceId> {
        *self.owner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn weight(&self) -> i32 {
        self.weight.load(Ordering::Relaxed)
    }

    pub fn conn_flags(&self) -> u32 {
        self.conn_flags.load(Ordering::Relaxed)
    }

    /// Forwarding method in the low bits of the stored flags.
    pub fn forwarding(&self) -> ForwardingMethod {
        ForwardingMethod::from_conn_flags(self.conn_flags()).unwrap_or_default()
    }

    pub fn active_conns(&self) -> u32 {
        self.active_conns.load(Ordering::Relaxed)
    }

    pub fn inactive_conns(&self) -> u32 {
        self.inactive_conns.load(Ordering::Relaxed)
    }

    pub fn structural_refs(&self) -> usize {
        self.structural_refs.load(Ordering::Acquire)
    }

    pub fn state(&self) -> DestState {
        DestState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn in_real_server_table(&self) -> bool {
        self.in_rs_table.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn view(&self) -> DestView {
        DestView {
            addr: self.addr,
            port: self.port,
            weight: self.weight(),
            conn_flags: self.conn_flags(),
            forwarding: self.forwarding(),
            active_conns: self.active_conns(),
            inactive_conns: self.inactive_conns(),
            stats: self.stats.snapshot(),
        }
    }

    /// Bind a new connection. The returned handle keeps the destination
    /// alive, even after it is unlinked, until it is dropped.
    pub fn bind_connection(self: &Arc<Self>) -> ConnectionRef {
        self.acquire_ref();
        self.active_conns.fetch_add(1, Ordering::Relaxed);
        self.stats.record_conn();
        ConnectionRef {
            dest: Arc::clone(self),
            active: true,
        }
    }

    pub(crate) fn matches(&self, addr: Ipv4Addr, port: u16) -> bool {
        self.addr == addr && self.port == port
    }

    pub(crate) fn apply(&self, weight: i32, method: ForwardingMethod) {
        self.weight.store(weight, Ordering::Relaxed);
        self.conn_flags
            .store(destination_conn_flags(method), Ordering::Relaxed);
    }

    pub(crate) fn set_owner(&self, owner: Option<ServiceId>) {
        *self.owner.lock().unwrap_or_else(PoisonError::into_inner) = owner;
    }

    pub(crate) fn set_state(&self, state: DestState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    pub(crate) fn set_in_rs_table(&self, present: bool) {
        self.in_rs_table.store(present, Ordering::Release);
    }

    pub(crate) fn acquire_ref(&self) {
        self.structural_refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one structural reference and return the remainder.
    pub(crate) fn release_ref(&self) -> usize {
        self.structural_refs.fetch_sub(1, Ordering::AcqRel) - 1
    }
}

/// A connection bound to a destination.
#[derive(Debug)]
pub struct ConnectionRef {
    dest: Arc<Destination>,
    active: bool,
}

impl ConnectionRef {
    pub fn destination(&self) -> &Arc<Destination> {
        &self.dest
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Move the connection between the active and inactive counters.
    pub fn set_active(&mut self, active: bool) {
        if self.active == active {
            return;
        }
        let (from, to) = if active {
            (&self.dest.inactive_conns, &self.dest.active_conns)
        } else {
            (&self.dest.active_conns, &self.dest.inactive_conns)
        };
        from.fetch_sub(1, Ordering::Relaxed);
        to.fetch_add(1, Ordering::Relaxed);
        self.active = active;
    }
}

impl Drop for ConnectionRef {
    fn drop(&mut self) {
        let counter = if self.active {
            &self.dest.active_conns
        } else {
            &self.dest.inactive_conns
        };
        counter.fetch_sub(1, Ordering::Relaxed);
        self.dest.release_ref();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::common::entity::Protocol;
    use crate::ipvs::arena::Arena;
    use crate::ipvs::entity::conn_flags;
    use crate::ipvs::scheduler::RoundRobin;

    fn make_service() -> Arc<VirtualService> {
        let key = ServiceKey::tuple(Protocol::Tcp, Ipv4Addr::new(10, 0, 0, 1), 80);
        let mut arena = Arena::new();
        let id = arena.insert_with(|id| id).unwrap();
        Arc::new(VirtualService::new(
            id,
            &ServiceConfig::new(key),
            Box::new(RoundRobin::default()),
        ))
    }

    fn make_dest() -> Arc<Destination> {
        let key = ServiceKey::tuple(Protocol::Tcp, Ipv4Addr::new(10, 0, 0, 1), 80);
        Arc::new(Destination::new(
            key,
            &DestConfig::new(Ipv4Addr::new(10, 0, 0, 2), 8080),
        ))
    }

    #[test]
    fn guard_counts_inflight_uses() {
        let svc = make_service();
        assert_eq!(svc.inflight_uses(), 1);
        let g1 = svc.acquire_use();
        let g2 = svc.acquire_use();
        assert_eq!(svc.inflight_uses(), 3);
        drop(g1);
        drop(g2);
        assert_eq!(svc.inflight_uses(), 1);
    }

    #[test]
    fn wait_quiescent_returns_immediately_when_idle() {
        let svc = make_service();
        svc.wait_quiescent();
        assert_eq!(svc.inflight_uses(), 1);
    }

    #[test]
    fn wait_quiescent_blocks_until_guard_dropped() {
        let svc = make_service();
        let guard = svc.acquire_use();
        let released = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&released);
        let holder = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::SeqCst);
            drop(guard);
        });
        svc.wait_quiescent();
        assert!(released.load(Ordering::SeqCst));
        holder.join().unwrap();
    }

    #[test]
    fn new_destination_flags_and_state() {
        let d = make_dest();
        assert_eq!(d.state(), DestState::Active);
        assert_eq!(d.structural_refs(), 0);
        assert_eq!(d.conn_flags() & conn_flags::INACTIVE, conn_flags::INACTIVE);
        assert_eq!(d.forwarding(), ForwardingMethod::Masquerade);
        assert_eq!(d.owner(), None);
    }

    #[test]
    fn connection_ref_holds_structural_reference() {
        let d = make_dest();
        d.acquire_ref();
        let mut conn = d.bind_connection();
        assert_eq!(d.structural_refs(), 2);
        assert_eq!(d.active_conns(), 1);

        conn.set_active(false);
        assert_eq!(d.active_conns(), 0);
        assert_eq!(d.inactive_conns(), 1);

        drop(conn);
        assert_eq!(d.inactive_conns(), 0);
        assert_eq!(d.structural_refs(), 1);
        assert_eq!(d.stats().snapshot().conns, 1);
    }

    #[test]
    fn apply_updates_weight_and_method() {
        let d = make_dest();
        d.apply(5, ForwardingMethod::DirectRoute);
        assert_eq!(d.weight(), 5);
        assert_eq!(d.forwarding(), ForwardingMethod::DirectRoute);
        assert_ne!(d.conn_flags() & conn_flags::NOOUTPUT, 0);
    }

    #[test]
    fn schedule_uses_bound_scheduler() {
        let svc = make_service();
        assert!(svc.schedule().is_none());
        svc.write_state().destinations.push(make_dest());
        assert_eq!(svc.schedule().unwrap().port(), 8080);
        assert_eq!(svc.view().num_dests, 1);
        assert_eq!(svc.scheduler_name(), "rr");
    }
}
