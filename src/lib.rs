pub mod app;
pub mod client;
pub mod config;
pub mod http;
pub mod mgmt;
pub mod proxy;
pub mod route;
pub mod telemetry;
pub mod transport;
