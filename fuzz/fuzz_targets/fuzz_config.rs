#![no_main]

use libfuzzer_sys::fuzz_target;

use infrastructure::config::AgentConfig;

// Fuzz the configuration parser and the conversions applied at startup.
// Must never panic, only return Ok or Err.
fuzz_target!(|data: &[u8]| {
    let Ok(yaml) = std::str::from_utf8(data) else {
        return;
    };
    if yaml.len() > 64 * 1024 {
        return;
    }
    if let Ok(config) = AgentConfig::from_yaml(yaml) {
        let _ = config.virtual_services();
        let _ = config.conn_timeouts();
        let _ = config.local_addresses();
        let _ = config.defense_tunables().validate();
    }
});
