#![forbid(unsafe_code)]

pub mod control_service_impl;
pub mod datapath;
pub mod defense_service_impl;
pub mod ipvs_service_impl;
pub mod wire_convert;
