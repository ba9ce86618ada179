pub mod arbitration;
pub mod cli;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod hostkey;
pub mod injector;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod transport;
