use std::io;

/// Secondary port reporting available system memory to the defense engine.
///
/// Implemented by `MeminfoProbe` in the infrastructure layer.
pub trait MemoryProbe: Send + Sync {
    /// Free plus reclaimable memory, in pages.
    fn available_pages(&self) -> io::Result<u64>;
}
