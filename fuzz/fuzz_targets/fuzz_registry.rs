#![no_main]

use std::net::Ipv4Addr;

use libfuzzer_sys::fuzz_target;

use domain::common::entity::Protocol;
use domain::ipvs::entity::{DestConfig, ForwardingMethod, ServiceConfig, ServiceKey};
use domain::ipvs::table::ServiceTable;

// Fuzz sequences of registry operations.
//
// Each 4-byte chunk is one operation:
//   [0] = opcode
//   [1] = service slot (a small key space so operations collide)
//   [2] = destination slot
//   [3] = weight / flags
//
// After every operation the table's internal consistency check must pass.
fuzz_target!(|data: &[u8]| {
    let mut table = ServiceTable::default();
    let mut held = Vec::new();

    for op in data.chunks_exact(4) {
        let key = service_key(op[1]);
        let dest_addr = Ipv4Addr::new(192, 168, 0, op[2] % 8);
        let dest_port = 8000 + u16::from(op[2] % 2);

        match op[0] % 10 {
            0 => {
                let _ = table.add_service(&ServiceConfig::new(key));
            }
            1 => {
                let mut cfg = ServiceConfig::new(key);
                cfg.timeout = u32::from(op[3]);
                let _ = table.edit_service(&cfg);
            }
            2 => {
                let _ = table.del_service(&key);
            }
            3 | 4 => {
                let cfg = DestConfig {
                    addr: dest_addr,
                    port: dest_port,
                    weight: i32::from(op[3] % 16),
                    forwarding: forwarding(op[3]),
                };
                let _ = table.add_dest(&key, &cfg);
            }
            5 => {
                let cfg = DestConfig {
                    addr: dest_addr,
                    port: dest_port,
                    weight: i32::from(op[3] % 16),
                    forwarding: forwarding(op[3]),
                };
                let _ = table.edit_dest(&key, &cfg);
            }
            6 => {
                let _ = table.del_dest(&key, dest_addr, dest_port);
            }
            7 => {
                // Keep connections bound across later operations so deleted
                // destinations park in the trash.
                let _ = table.lookup_service(0, key.protocol(), key.addr(), key.port());
                if let Some(dest) = table.lookup_real_server(key.protocol(), dest_addr, dest_port)
                    && held.len() < 8
                {
                    held.push(dest.bind_connection());
                }
            }
            8 => {
                held.clear();
                let _ = table.zero(if op[3] & 1 == 0 { None } else { Some(&key) });
            }
            _ => {
                if op[3] == 0xff {
                    let _ = table.flush();
                }
            }
        }

        if let Err(e) = table.verify() {
            panic!("registry inconsistent after op {op:?}: {e}");
        }
    }
});

fn service_key(slot: u8) -> ServiceKey {
    let protocol = if slot & 0x10 == 0 {
        Protocol::Tcp
    } else {
        Protocol::Udp
    };
    match slot % 4 {
        0 => ServiceKey::mark(protocol, u32::from(slot % 3) + 1),
        1 => ServiceKey::tuple(protocol, Ipv4Addr::new(10, 0, 0, 1), 0),
        _ => ServiceKey::tuple(protocol, Ipv4Addr::new(10, 0, 0, slot % 3), 80),
    }
}

fn forwarding(bits: u8) -> ForwardingMethod {
    match bits >> 6 {
        0 => ForwardingMethod::Masquerade,
        1 => ForwardingMethod::Tunnel,
        2 => ForwardingMethod::DirectRoute,
        _ => ForwardingMethod::LocalNode,
    }
}
