pub mod framing;
pub mod unix_server;
