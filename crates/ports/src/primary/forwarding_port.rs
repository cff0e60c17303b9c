use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use domain::common::entity::Protocol;
use domain::defense::timeouts::ConnState;
use domain::ipvs::service::{Destination, ServiceGuard};

/// Primary port used by the packet path.
///
/// Lookups return a guard that keeps the service from being mutated until it
/// is dropped. Guards must not be held across another lookup on the same
/// thread while an administrative writer may be waiting.
pub trait ForwardingPort: Send + Sync {
    /// Resolve a packet to a virtual service (mark, exact, FTP, wildcard).
    fn lookup_service(
        &self,
        fwmark: u32,
        protocol: Protocol,
        addr: Ipv4Addr,
        port: u16,
    ) -> Option<ServiceGuard>;

    /// Find a masquerade destination for return traffic.
    fn lookup_real_server(
        &self,
        protocol: Protocol,
        addr: Ipv4Addr,
        port: u16,
    ) -> Option<Arc<Destination>>;

    /// Sample the drop-packet control for one incoming packet.
    fn todrop(&self) -> bool;

    /// Whether the external connection sweep should drop entries.
    fn drop_entry_active(&self) -> bool;

    /// Idle timeout for a connection state under the current table.
    fn conn_timeout(&self, state: ConnState) -> Duration;
}
