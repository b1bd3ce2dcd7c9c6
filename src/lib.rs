pub mod adapters;
pub mod api;
pub mod clients;
pub mod config;
pub mod error;
pub mod invocation;
pub mod lifecycle;
pub mod models;
pub mod telemetry;
