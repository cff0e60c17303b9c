#![forbid(unsafe_code)]

pub mod common;
pub mod defense;
pub mod ipvs;
