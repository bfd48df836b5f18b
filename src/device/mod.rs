pub mod codec;
pub mod command;
pub mod constants;
pub mod manager;
pub mod radio;
pub mod session;
pub mod telemetry;
pub mod transport;
pub mod types;
