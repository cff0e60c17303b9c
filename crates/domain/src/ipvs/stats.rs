use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

/// Traffic counters updated lock-free from the packet path.
///
/// Rates are written by the external estimator while `estimating` is set.
#[derive(Debug, Default)]
pub struct Stats {
    conns: AtomicU32,
    inpkts: AtomicU32,
    outpkts: AtomicU32,
    inbytes: AtomicU64,
    outbytes: AtomicU64,
    cps: AtomicU32,
    inpps: AtomicU32,
    outpps: AtomicU32,
    inbps: AtomicU32,
    outbps: AtomicU32,
    estimating: AtomicBool,
}

/// Plain copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub conns: u32,
    pub inpkts: u32,
    pub outpkts: u32,
    pub inbytes: u64,
    pub outbytes: u64,
    pub cps: u32,
    pub inpps: u32,
    pub outpps: u32,
    pub inbps: u32,
    pub outbps: u32,
}

/// Rates as produced by an estimator pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rates {
    pub cps: u32,
    pub inpps: u32,
    pub outpps: u32,
    pub inbps: u32,
    pub outbps: u32,
}

impl Stats {
    pub fn record_conn(&self) {
        self.conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_in(&self, bytes: u64) {
        self.inpkts.fetch_add(1, Ordering::Relaxed);
        self.inbytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_out(&self, bytes: u64) {
        self.outpkts.fetch_add(1, Ordering::Relaxed);
        self.outbytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Store estimator output. Ignored while the estimator is stopped.
    pub fn set_rates(&self, rates: Rates) {
        if !self.is_estimating() {
            return;
        }
        self.cps.store(rates.cps, Ordering::Relaxed);
        self.inpps.store(rates.inpps, Ordering::Relaxed);
        self.outpps.store(rates.outpps, Ordering::Relaxed);
        self.inbps.store(rates.inbps, Ordering::Relaxed);
        self.outbps.store(rates.outbps, Ordering::Relaxed);
    }

    pub fn start_estimator(&self) {
        self.estimating.store(true, Ordering::Release);
    }

    pub fn stop_estimator(&self) {
        self.estimating.store(false, Ordering::Release);
    }

    pub fn is_estimating(&self) -> bool {
        self.estimating.load(Ordering::Acquire)
    }

    /// Reset every counter and rate. The estimator state is untouched.
    pub fn zero(&self) {
        for c in [
            &self.conns,
            &self.inpkts,
            &self.outpkts,
            &self.cps,
            &self.inpps,
            &self.outpps,
            &self.inbps,
            &self.outbps,
        ] {
            c.store(0, Ordering::Relaxed);
        }
        self.inbytes.store(0, Ordering::Relaxed);
        self.outbytes.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            conns: self.conns.load(Ordering::Relaxed),
            inpkts: self.inpkts.load(Ordering::Relaxed),
            outpkts: self.outpkts.load(Ordering::Relaxed),
            inbytes: self.inbytes.load(Ordering::Relaxed),
            outbytes: self.outbytes.load(Ordering::Relaxed),
            cps: self.cps.load(Ordering::Relaxed),
            inpps: self.inpps.load(Ordering::Relaxed),
            outpps: self.outpps.load(Ordering::Relaxed),
            inbps: self.inbps.load(Ordering::Relaxed),
            outbps: self.outbps.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_zero() {
        let s = Stats::default();
        s.record_conn();
        s.record_in(100);
        s.record_in(50);
        s.record_out(10);
        let snap = s.snapshot();
        assert_eq!(snap.conns, 1);
        assert_eq!(snap.inpkts, 2);
        assert_eq!(snap.inbytes, 150);
        assert_eq!(snap.outbytes, 10);

        s.zero();
        assert_eq!(s.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn rates_only_written_while_estimating() {
        let s = Stats::default();
        let rates = Rates {
            cps: 5,
            ..Rates::default()
        };
        s.set_rates(rates);
        assert_eq!(s.snapshot().cps, 0);

        s.start_estimator();
        s.set_rates(rates);
        assert_eq!(s.snapshot().cps, 5);

        s.stop_estimator();
        assert!(!s.is_estimating());
    }

    #[test]
    fn zero_keeps_estimator_running() {
        let s = Stats::default();
        s.start_estimator();
        s.zero();
        assert!(s.is_estimating());
    }
}
