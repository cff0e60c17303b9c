use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use domain::common::entity::Protocol;
use domain::defense::timeouts::ConnState;
use domain::ipvs::service::{Destination, ServiceGuard};
use ports::primary::forwarding_port::ForwardingPort;

use crate::defense_service_impl::DefenseAppService;
use crate::ipvs_service_impl::IpvsAppService;

/// Packet-path facade over the registry and the defense controls.
#[derive(Clone)]
pub struct Datapath {
    ipvs: Arc<IpvsAppService>,
    defense: Arc<DefenseAppService>,
}

impl Datapath {
    pub fn new(ipvs: Arc<IpvsAppService>, defense: Arc<DefenseAppService>) -> Self {
        Self { ipvs, defense }
    }
}

impl ForwardingPort for Datapath {
    fn lookup_service(
        &self,
        fwmark: u32,
        protocol: Protocol,
        addr: Ipv4Addr,
        port: u16,
    ) -> Option<ServiceGuard> {
        self.ipvs.lookup_service(fwmark, protocol, addr, port)
    }

    fn lookup_real_server(
        &self,
        protocol: Protocol,
        addr: Ipv4Addr,
        port: u16,
    ) -> Option<Arc<Destination>> {
        self.ipvs.lookup_real_server(protocol, addr, port)
    }

    fn todrop(&self) -> bool {
        self.defense.todrop()
    }

    fn drop_entry_active(&self) -> bool {
        self.defense.drop_entry_active()
    }

    fn conn_timeout(&self, state: ConnState) -> Duration {
        self.defense.conn_timeout(state)
    }
}
