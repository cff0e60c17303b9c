pub mod memory_port;
pub mod metrics_port;
