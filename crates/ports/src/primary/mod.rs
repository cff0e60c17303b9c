pub mod forwarding_port;
