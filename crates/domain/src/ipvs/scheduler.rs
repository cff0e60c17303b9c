use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::ipvs::entity::ServiceKey;
use crate::ipvs::error::IpvsError;
use crate::ipvs::service::Destination;

/// A pluggable destination selection policy bound to one service.
///
/// `update_service` runs while the service is exclusively held by the
/// registry, after any membership or weight change. `schedule` runs on the
/// packet path under a shared hold.
pub trait Scheduler: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn bind(&self, _service: &ServiceKey) -> Result<(), IpvsError> {
        Ok(())
    }

    fn unbind(&self, _service: &ServiceKey) -> Result<(), IpvsError> {
        Ok(())
    }

    fn update_service(&self, _dests: &[Arc<Destination>]) {}

    fn schedule(&self, dests: &[Arc<Destination>]) -> Option<Arc<Destination>>;
}

/// Builds a fresh scheduler instance for each bound service.
pub type SchedulerFactory = Arc<dyn Fn() -> Box<dyn Scheduler> + Send + Sync>;

/// Name to factory map of the schedulers available for binding.
#[derive(Clone, Default)]
pub struct SchedulerRegistry {
    factories: BTreeMap<String, SchedulerFactory>,
}

impl fmt::Debug for SchedulerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerRegistry")
            .field("names", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SchedulerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in round-robin scheduler.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        reg.factories.insert(
            RoundRobin::NAME.to_string(),
            Arc::new(|| -> Box<dyn Scheduler> { Box::new(RoundRobin::default()) }),
        );
        reg
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: SchedulerFactory,
    ) -> Result<(), IpvsError> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(IpvsError::SchedulerExists { name });
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Instantiate a scheduler by name.
    pub fn create(&self, name: &str) -> Result<Box<dyn Scheduler>, IpvsError> {
        self.factories
            .get(name)
            .map(|f| f())
            .ok_or_else(|| IpvsError::SchedulerNotFound {
                name: name.to_string(),
            })
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

// ── Round robin ───────────────────────────────────────────────────────

/// Cycles through destinations, skipping those with weight zero.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub const NAME: &'static str = "rr";
}

impl Scheduler for RoundRobin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn update_service(&self, _dests: &[Arc<Destination>]) {
        self.cursor.store(0, Ordering::Relaxed);
    }

    fn schedule(&self, dests: &[Arc<Destination>]) -> Option<Arc<Destination>> {
        let n = dests.len();
        if n == 0 {
            return None;
        }
        let start = self.cursor.load(Ordering::Relaxed) % n;
        for step in 0..n {
            let i = (start + step) % n;
            if dests[i].weight() > 0 {
                self.cursor.store(i + 1, Ordering::Relaxed);
                return Some(Arc::clone(&dests[i]));
            }
        }
        None
    }
}
