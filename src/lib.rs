//! telemetry gateway library
//!
//! ingests temperature/humidity samples from a serial device and from http
//! pushes, keeps an append-only sqlite history, arbitrates the current reading
//! and fans accepted samples out to live clients.

pub mod arbiter;
pub mod config;
pub mod device;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod parser;
pub mod server;
pub mod store;
pub mod validate;
