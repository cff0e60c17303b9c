use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::secondary::memory_port::MemoryProbe;
use crate::secondary::metrics_port::{ControlMetrics, DefenseMetrics, RegistryMetrics};

/// No-op implementation of all metrics sub-traits for use in tests.
pub struct NoopMetrics;

impl RegistryMetrics for NoopMetrics {}
impl DefenseMetrics for NoopMetrics {}
impl ControlMetrics for NoopMetrics {}

/// Memory probe returning a settable value, or an error when failing.
#[derive(Debug, Default)]
pub struct FixedMemory {
    pages: AtomicU64,
    failing: AtomicBool,
}

impl FixedMemory {
    pub fn new(pages: u64) -> Self {
        Self {
            pages: AtomicU64::new(pages),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set(&self, pages: u64) {
        self.pages.store(pages, Ordering::Relaxed);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

impl MemoryProbe for FixedMemory {
    fn available_pages(&self) -> io::Result<u64> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(io::Error::other("probe unavailable"));
        }
        Ok(self.pages.load(Ordering::Relaxed))
    }
}
