pub mod arena;
pub mod daemon;
pub mod entity;
pub mod error;
pub mod hash;
pub mod scheduler;
pub mod service;
pub mod stats;
pub mod table;
