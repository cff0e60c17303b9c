#![forbid(unsafe_code)]

pub mod error;
pub mod frame;
pub mod sockopt;
pub mod user;

pub use error::WireError;
