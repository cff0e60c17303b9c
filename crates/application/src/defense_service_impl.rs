use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use domain::common::error::DomainError;
use domain::defense::engine::{DropPacketControl, LatchControl, is_low_memory};
use domain::defense::entity::{DefenseSnapshot, DefenseTunables, DefenseUpdate, EffectiveFlags};
use domain::defense::timeouts::{ConnState, ConnTimeouts, UserTimeouts};
use ports::secondary::memory_port::MemoryProbe;
use ports::secondary::metrics_port::MetricsPort;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Default period of the defense evaluation.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Adaptive defense against memory exhaustion.
///
/// Each control sits behind its own mutex so the packet path sampling
/// `drop_packet` never contends with `drop_entry` or `secure_tcp`, and none
/// of them with the service registry.
pub struct DefenseAppService {
    tunables: RwLock<DefenseTunables>,
    drop_entry: Mutex<LatchControl>,
    drop_packet: Mutex<DropPacketControl>,
    secure_tcp: Mutex<LatchControl>,
    timeouts: RwLock<ConnTimeouts>,
    memory: Arc<dyn MemoryProbe>,
    metrics: Arc<dyn MetricsPort>,
    tick_interval: Duration,
}

impl DefenseAppService {
    pub fn new(
        tunables: DefenseTunables,
        timeouts: ConnTimeouts,
        memory: Arc<dyn MemoryProbe>,
        metrics: Arc<dyn MetricsPort>,
    ) -> Self {
        let secure_tcp = LatchControl::new(tunables.secure_tcp);
        let mut timeouts = timeouts;
        timeouts.set_secure(secure_tcp.is_active());
        Self {
            drop_entry: Mutex::new(LatchControl::new(tunables.drop_entry)),
            drop_packet: Mutex::new(DropPacketControl::new(tunables.drop_packet)),
            secure_tcp: Mutex::new(secure_tcp),
            tunables: RwLock::new(tunables),
            timeouts: RwLock::new(timeouts),
            memory,
            metrics,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Run the periodic evaluation until `cancel` fires. Call this from a
    /// spawned Tokio task.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(
            interval_ms = self.tick_interval.as_millis() as u64,
            "defense timer started"
        );
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => self.tick(),
            }
        }
        tracing::info!("defense timer stopped");
    }

    /// One evaluation of all three controls against current memory.
    pub fn tick(&self) {
        let available = match self.memory.available_pages() {
            Ok(pages) => pages,
            Err(e) => {
                self.metrics.record_memory_probe_error();
                tracing::warn!(error = %e, "memory probe failed, defense state unchanged");
                return;
            }
        };
        let tunables = *self.tunables.read().unwrap_or_else(PoisonError::into_inner);
        let low = is_low_memory(available, tunables.amemthresh);
        self.metrics.set_available_memory_pages(available);

        let (level, update) = {
            let mut c = lock(&self.drop_entry);
            let u = c.update(low);
            (c.level(), u)
        };
        self.report("drop_entry", level.as_u32(), update.active);
        if update.changed {
            tracing::info!(active = update.active, available, "drop_entry toggled");
        }

        let (level, update, rate) = {
            let mut c = lock(&self.drop_packet);
            let u = c.update(available, tunables.amemthresh, tunables.am_droprate);
            (c.level(), u, c.rate())
        };
        self.report("drop_packet", level.as_u32(), update.active);
        self.metrics.set_drop_rate(rate);
        if update.changed {
            tracing::info!(active = update.active, drop_rate = rate, available, "drop_packet toggled");
        }

        let (level, update) = {
            let mut c = lock(&self.secure_tcp);
            let u = c.update(low);
            (c.level(), u)
        };
        self.report("secure_tcp", level.as_u32(), update.active);
        {
            // The table follows the effective flag, whatever the control
            // started from.
            let mut timeouts = self.timeouts.write().unwrap_or_else(PoisonError::into_inner);
            if timeouts.is_secure() != update.active {
                timeouts.set_secure(update.active);
            }
        }
        if update.changed {
            tracing::info!(active = update.active, available, "secure_tcp toggled");
        }
    }

    fn report(&self, control: &str, level: u32, active: bool) {
        self.metrics.set_defense_level(control, level);
        self.metrics.set_defense_active(control, active);
    }

    // ── Packet path ───────────────────────────────────────────────

    pub fn todrop(&self) -> bool {
        lock(&self.drop_packet).todrop()
    }

    pub fn drop_entry_active(&self) -> bool {
        lock(&self.drop_entry).is_active()
    }

    pub fn secure_tcp_active(&self) -> bool {
        lock(&self.secure_tcp).is_active()
    }

    pub fn conn_timeout(&self, state: ConnState) -> Duration {
        self.timeouts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .effective()
            .get(state)
    }

    // ── Administration ────────────────────────────────────────────

    /// Tunables with the live level of each control.
    pub fn snapshot(&self) -> DefenseSnapshot {
        let mut tunables = *self.tunables.read().unwrap_or_else(PoisonError::into_inner);
        let drop_entry = *lock(&self.drop_entry);
        let drop_packet = *lock(&self.drop_packet);
        let secure_tcp = *lock(&self.secure_tcp);
        tunables.drop_entry = drop_entry.level();
        tunables.drop_packet = drop_packet.level();
        tunables.secure_tcp = secure_tcp.level();
        DefenseSnapshot {
            tunables,
            effective: EffectiveFlags {
                drop_entry: drop_entry.is_active(),
                drop_packet: drop_packet.is_active(),
                secure_tcp: secure_tcp.is_active(),
            },
            drop_rate: drop_packet.rate(),
        }
    }

    /// Apply a partial tunable update. Level changes take effect on the
    /// next tick.
    pub fn set_tunables(&self, update: &DefenseUpdate) -> Result<DefenseTunables, DomainError> {
        let current = self.snapshot().tunables;
        let next = current.merged(update)?;

        *self.tunables.write().unwrap_or_else(PoisonError::into_inner) = next;
        if let Some(level) = update.drop_entry {
            lock(&self.drop_entry).set_level(level);
        }
        if let Some(level) = update.drop_packet {
            lock(&self.drop_packet).set_level(level);
        }
        if let Some(level) = update.secure_tcp {
            lock(&self.secure_tcp).set_level(level);
        }
        tracing::info!(
            drop_entry = %next.drop_entry,
            drop_packet = %next.drop_packet,
            secure_tcp = %next.secure_tcp,
            amemthresh = next.amemthresh,
            am_droprate = next.am_droprate,
            "defense tunables updated"
        );
        Ok(next)
    }

    pub fn user_timeouts(&self) -> UserTimeouts {
        self.timeouts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .user()
    }

    pub fn set_user_timeouts(&self, t: UserTimeouts) -> UserTimeouts {
        let mut timeouts = self.timeouts.write().unwrap_or_else(PoisonError::into_inner);
        timeouts.set_user(t);
        let now = timeouts.user();
        tracing::info!(tcp = now.tcp, tcp_fin = now.tcp_fin, udp = now.udp, "timeouts updated");
        now
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use domain::defense::entity::DefenseLevel;
    use ports::test_utils::{FixedMemory, NoopMetrics};

    use super::*;

    fn make_service(pages: u64, tunables: DefenseTunables) -> (DefenseAppService, Arc<FixedMemory>) {
        let memory = Arc::new(FixedMemory::new(pages));
        let svc = DefenseAppService::new(
            tunables,
            ConnTimeouts::default(),
            memory.clone(),
            Arc::new(NoopMetrics),
        );
        (svc, memory)
    }

    fn auto_everything(amemthresh: u32) -> DefenseTunables {
        DefenseTunables {
            drop_entry: DefenseLevel::AutoLatchable,
            drop_packet: DefenseLevel::AutoLatchable,
            secure_tcp: DefenseLevel::AutoLatchable,
            amemthresh,
            ..DefenseTunables::default()
        }
    }

    #[test]
    fn pressure_engages_all_auto_controls() {
        let (svc, _mem) = make_service(100, auto_everything(1_000_000));
        svc.tick();
        let snap = svc.snapshot();
        assert!(snap.effective.drop_entry);
        assert!(snap.effective.drop_packet);
        assert!(snap.effective.secure_tcp);
        assert_eq!(snap.drop_rate, 1);
        assert_eq!(snap.tunables.drop_packet, DefenseLevel::AutoActive);
        assert!(svc.secure_tcp_active());
        assert_eq!(svc.conn_timeout(ConnState::SynRecv), Duration::from_secs(10));
    }

    fn always_on(control: &str) -> DefenseTunables {
        let mut t = DefenseTunables {
            am_droprate: 4,
            ..DefenseTunables::default()
        };
        match control {
            "drop_entry" => t.drop_entry = DefenseLevel::AlwaysOn,
            "drop_packet" => t.drop_packet = DefenseLevel::AlwaysOn,
            _ => t.secure_tcp = DefenseLevel::AlwaysOn,
        }
        t
    }

    #[test]
    fn secure_tcp_always_on_hardens_timeouts_from_start() {
        let (svc, _mem) = make_service(1 << 20, always_on("secure_tcp"));
        assert!(svc.secure_tcp_active());
        assert_eq!(svc.conn_timeout(ConnState::SynRecv), Duration::from_secs(10));

        svc.tick();
        svc.tick();
        assert!(svc.snapshot().effective.secure_tcp);
        assert_eq!(svc.conn_timeout(ConnState::SynRecv), Duration::from_secs(10));
    }

    #[test]
    fn secure_tcp_level_change_to_always_on_hardens_next_tick() {
        let (svc, _mem) = make_service(1 << 20, DefenseTunables::default());
        svc.tick();
        assert_eq!(svc.conn_timeout(ConnState::SynRecv), Duration::from_secs(60));

        let update = DefenseUpdate {
            secure_tcp: Some(DefenseLevel::AlwaysOn),
            ..DefenseUpdate::default()
        };
        svc.set_tunables(&update).unwrap();
        svc.tick();
        assert_eq!(svc.conn_timeout(ConnState::SynRecv), Duration::from_secs(10));

        let update = DefenseUpdate {
            secure_tcp: Some(DefenseLevel::Off),
            ..DefenseUpdate::default()
        };
        svc.set_tunables(&update).unwrap();
        svc.tick();
        assert!(!svc.secure_tcp_active());
        assert_eq!(svc.conn_timeout(ConnState::SynRecv), Duration::from_secs(60));
    }

    #[test]
    fn drop_entry_always_on_from_start() {
        let (svc, _mem) = make_service(1 << 20, always_on("drop_entry"));
        assert!(svc.drop_entry_active());
        svc.tick();
        assert!(svc.drop_entry_active());
        assert!(svc.snapshot().effective.drop_entry);
        assert!(!svc.snapshot().effective.drop_packet);
    }

    #[test]
    fn drop_packet_always_on_samples_at_am_droprate() {
        let (svc, _mem) = make_service(1 << 20, always_on("drop_packet"));
        svc.tick();
        let snap = svc.snapshot();
        assert!(snap.effective.drop_packet);
        assert_eq!(snap.drop_rate, 4);

        let drops: Vec<bool> = (0..8).map(|_| svc.todrop()).collect();
        assert_eq!(
            drops,
            vec![true, false, false, false, true, false, false, false]
        );
    }

    #[test]
    fn abundant_memory_disengages_within_one_tick() {
        let (svc, mem) = make_service(100, auto_everything(1024));
        svc.tick();
        assert!(svc.snapshot().effective.drop_packet);

        mem.set(1 << 20);
        svc.tick();
        let snap = svc.snapshot();
        assert_eq!(snap.effective, EffectiveFlags::default());
        assert_eq!(snap.drop_rate, 0);
        assert_eq!(snap.tunables.drop_packet, DefenseLevel::AutoLatchable);
        assert!(!svc.todrop());
        assert_eq!(svc.conn_timeout(ConnState::SynRecv), Duration::from_secs(60));
    }

    #[test]
    fn probe_failure_keeps_state() {
        let (svc, mem) = make_service(100, auto_everything(1024));
        svc.tick();
        mem.set_failing(true);
        mem.set(1 << 20);
        svc.tick();
        assert!(svc.drop_entry_active());
    }

    #[test]
    fn set_tunables_applies_on_next_tick() {
        let (svc, _mem) = make_service(1 << 20, DefenseTunables::default());
        svc.tick();
        assert!(!svc.snapshot().effective.drop_packet);

        let update = DefenseUpdate {
            drop_packet: Some(DefenseLevel::AlwaysOn),
            am_droprate: Some(5),
            ..DefenseUpdate::default()
        };
        let next = svc.set_tunables(&update).unwrap();
        assert_eq!(next.drop_packet, DefenseLevel::AlwaysOn);
        assert_eq!(svc.snapshot().drop_rate, 0);

        svc.tick();
        assert_eq!(svc.snapshot().drop_rate, 5);
        assert!(svc.todrop());
    }

    #[test]
    fn invalid_update_rejected_and_nothing_changes() {
        let (svc, _mem) = make_service(1 << 20, DefenseTunables::default());
        let update = DefenseUpdate {
            drop_entry: Some(DefenseLevel::AlwaysOn),
            amemthresh: Some(0),
            ..DefenseUpdate::default()
        };
        assert!(matches!(
            svc.set_tunables(&update),
            Err(DomainError::InvalidArgument(_))
        ));
        assert_eq!(svc.snapshot().tunables.drop_entry, DefenseLevel::Off);
        assert_eq!(svc.snapshot().tunables.amemthresh, 1024);
    }

    #[test]
    fn user_timeouts_roundtrip() {
        let (svc, _mem) = make_service(1 << 20, DefenseTunables::default());
        let now = svc.set_user_timeouts(UserTimeouts {
            tcp: 100,
            tcp_fin: 0,
            udp: 30,
        });
        assert_eq!(
            now,
            UserTimeouts {
                tcp: 100,
                tcp_fin: 120,
                udp: 30,
            }
        );
        assert_eq!(svc.user_timeouts(), now);
        assert_eq!(
            svc.conn_timeout(ConnState::Established),
            Duration::from_secs(100)
        );
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let (svc, _mem) = make_service(100, auto_everything(1024));
        let svc = Arc::new(svc.with_tick_interval(Duration::from_millis(10)));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&svc).run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(svc.drop_entry_active());

        cancel.cancel();
        handle.await.unwrap();
    }
}
