#![no_main]

use libfuzzer_sys::fuzz_target;

use application::wire_convert::{
    daemon_config, defense_update, dest_config, service_config, service_key,
};
use ipvs_common::user::{
    DaemonUser, DefenseUser, DestUser, GetDestsHeader, GetServicesHeader, ServiceEntry,
    ServiceUser, Wire, decode_entries,
};

// Fuzz payload decoding and the conversion into domain requests.
//
// Layout:
//   [0]  = selector
//   rest = payload for the chosen structure
fuzz_target!(|data: &[u8]| {
    let Some((&selector, payload)) = data.split_first() else {
        return;
    };

    match selector % 6 {
        0 => {
            if let Ok(u) = ServiceUser::from_slice(payload) {
                let _ = service_key(&u);
                let _ = service_config(&u);
            }
        }
        1 => {
            if payload.len() >= ServiceUser::SIZE + DestUser::SIZE {
                let (svc, dest) = payload.split_at(ServiceUser::SIZE);
                if let (Ok(s), Ok(d)) = (
                    ServiceUser::from_slice(svc),
                    DestUser::from_slice(&dest[..DestUser::SIZE]),
                ) {
                    let _ = service_key(&s);
                    if let Ok(cfg) = dest_config(&d) {
                        let _ = cfg.validate();
                    }
                }
            }
        }
        2 => {
            if let Ok(u) = DaemonUser::from_slice(payload) {
                let _ = daemon_config(&u);
            }
        }
        3 => {
            if let Ok(u) = DefenseUser::from_slice(payload) {
                let _ = defense_update(&u);
            }
        }
        4 => {
            let mut buf = payload;
            if let Ok(h) = GetServicesHeader::decode(&mut buf) {
                let _ = decode_entries::<ServiceEntry>(&mut buf, h.num_services as usize);
            }
        }
        _ => {
            let mut buf = payload;
            if let Ok(h) = GetDestsHeader::decode(&mut buf) {
                let _ = decode_entries::<ipvs_common::user::DestEntry>(
                    &mut buf,
                    h.num_dests as usize,
                );
            }
        }
    }
});
