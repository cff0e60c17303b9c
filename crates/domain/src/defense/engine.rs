use super::entity::DefenseLevel;

/// `true` when available memory has fallen below the threshold.
pub fn is_low_memory(available_pages: u64, amemthresh: u32) -> bool {
    available_pages < u64::from(amemthresh)
}

/// Packet drop interval under memory pressure: one in
/// `amemthresh / (amemthresh - available)` packets.
///
/// Only meaningful while [`is_low_memory`] holds; returns 0 otherwise.
pub fn drop_rate(amemthresh: u32, available_pages: u64) -> u32 {
    let thresh = u64::from(amemthresh);
    if available_pages >= thresh {
        return 0;
    }
    let rate = thresh / (thresh - available_pages);
    u32::try_from(rate).unwrap_or(u32::MAX)
}

// ── Latch control ─────────────────────────────────────────────────────

/// A control with no state beyond its level and engagement, used for
/// `drop_entry` and `secure_tcp`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatchControl {
    level: DefenseLevel,
    active: bool,
}

/// Result of updating one control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlUpdate {
    pub active: bool,
    pub changed: bool,
}

impl LatchControl {
    pub fn new(level: DefenseLevel) -> Self {
        Self {
            level,
            active: level == DefenseLevel::AlwaysOn,
        }
    }

    pub fn level(&self) -> DefenseLevel {
        self.level
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Administrative level change. Engagement follows on the next update.
    pub fn set_level(&mut self, level: DefenseLevel) {
        self.level = level;
    }

    pub fn update(&mut self, low_memory: bool) -> ControlUpdate {
        let (level, active) = self.level.transition(low_memory);
        let changed = active != self.active;
        self.level = level;
        self.active = active;
        ControlUpdate { active, changed }
    }
}

// ── Drop packet control ───────────────────────────────────────────────

/// Probabilistic packet dropping: every `rate`-th packet is dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropPacketControl {
    level: DefenseLevel,
    rate: u32,
    counter: u32,
}

impl DropPacketControl {
    pub fn new(level: DefenseLevel) -> Self {
        Self {
            level,
            rate: 0,
            counter: 0,
        }
    }

    pub fn level(&self) -> DefenseLevel {
        self.level
    }

    pub fn set_level(&mut self, level: DefenseLevel) {
        self.level = level;
    }

    /// Current drop interval; zero means not dropping.
    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn is_active(&self) -> bool {
        self.rate > 0
    }

    pub fn update(&mut self, available_pages: u64, amemthresh: u32, am_droprate: u32) -> ControlUpdate {
        let was_active = self.is_active();
        let low = is_low_memory(available_pages, amemthresh);
        let (level, active) = self.level.transition(low);
        self.level = level;

        if !active {
            self.rate = 0;
        } else if level == DefenseLevel::AlwaysOn {
            self.rate = am_droprate;
        } else {
            self.rate = drop_rate(amemthresh, available_pages).max(1);
            self.counter = self.rate;
        }
        ControlUpdate {
            active: self.is_active(),
            changed: self.is_active() != was_active,
        }
    }

    /// Packet-path sampling: `true` for the packet that should be dropped.
    pub fn todrop(&mut self) -> bool {
        if self.rate == 0 {
            return false;
        }
        self.counter = self.counter.saturating_sub(1);
        if self.counter > 0 {
            return false;
        }
        self.counter = self.rate;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_memory_is_strict() {
        assert!(is_low_memory(1023, 1024));
        assert!(!is_low_memory(1024, 1024));
    }

    #[test]
    fn drop_rate_formula() {
        assert_eq!(drop_rate(1024, 0), 1);
        assert_eq!(drop_rate(1024, 512), 2);
        assert_eq!(drop_rate(1024, 1000), 42);
        assert_eq!(drop_rate(1024, 1023), 1024);
        assert_eq!(drop_rate(1024, 4096), 0);
    }

    #[test]
    fn latch_auto_engages_and_demotes() {
        let mut c = LatchControl::new(DefenseLevel::AutoLatchable);
        assert!(!c.is_active());

        let u = c.update(true);
        assert!(u.active && u.changed);
        assert_eq!(c.level(), DefenseLevel::AutoActive);

        let u = c.update(true);
        assert!(u.active && !u.changed);

        let u = c.update(false);
        assert!(!u.active && u.changed);
        assert_eq!(c.level(), DefenseLevel::AutoLatchable);
    }

    #[test]
    fn latch_off_and_always() {
        let mut off = LatchControl::new(DefenseLevel::Off);
        assert!(!off.update(true).active);
        let mut on = LatchControl::new(DefenseLevel::AlwaysOn);
        assert!(on.is_active());
        assert!(on.update(false).active);
    }

    #[test]
    fn drop_packet_under_pressure() {
        let mut c = DropPacketControl::new(DefenseLevel::AutoLatchable);
        // amemthresh far above free memory
        let u = c.update(10, 100_000, 10);
        assert!(u.active && u.changed);
        assert_eq!(c.rate(), 1);
        assert_eq!(c.level(), DefenseLevel::AutoActive);

        let u = c.update(99_000, 100_000, 10);
        assert!(u.active);
        assert_eq!(c.rate(), 100);
    }

    #[test]
    fn drop_packet_off_within_one_tick_when_memory_returns() {
        let mut c = DropPacketControl::new(DefenseLevel::AutoLatchable);
        c.update(10, 1024, 10);
        assert!(c.is_active());
        let u = c.update(1 << 20, 1024, 10);
        assert!(!u.active && u.changed);
        assert_eq!(c.rate(), 0);
        assert_eq!(c.level(), DefenseLevel::AutoLatchable);
        assert!(!c.todrop());
    }

    #[test]
    fn drop_packet_always_uses_am_droprate() {
        let mut c = DropPacketControl::new(DefenseLevel::AlwaysOn);
        c.update(1 << 20, 1024, 10);
        assert_eq!(c.rate(), 10);
    }

    #[test]
    fn todrop_samples_one_in_rate() {
        let mut c = DropPacketControl::new(DefenseLevel::AlwaysOn);
        c.update(1 << 20, 1024, 4);
        let drops: Vec<bool> = (0..8).map(|_| c.todrop()).collect();
        // Counter starts at zero, so the first packet reloads it.
        assert_eq!(
            drops,
            vec![true, false, false, false, true, false, false, false]
        );
    }

    #[test]
    fn todrop_rate_one_drops_everything() {
        let mut c = DropPacketControl::new(DefenseLevel::AutoLatchable);
        c.update(0, 1024, 10);
        assert_eq!(c.rate(), 1);
        assert!((0..5).all(|_| c.todrop()));
    }

    #[test]
    fn evaluation_order_does_not_matter() {
        let levels = [
            DefenseLevel::AutoLatchable,
            DefenseLevel::AlwaysOn,
            DefenseLevel::AutoActive,
        ];
        for low in [true, false] {
            let mut forward: Vec<LatchControl> =
                levels.iter().map(|l| LatchControl::new(*l)).collect();
            let mut backward = forward.clone();
            for c in &mut forward {
                c.update(low);
            }
            for c in backward.iter_mut().rev() {
                c.update(low);
            }
            assert_eq!(forward, backward);
        }
    }
}
