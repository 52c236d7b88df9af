//! netpulse - network latency monitoring.
//!
//! Probes the default gateways and a user-defined set of hosts on a fixed
//! interval, classifies each round-trip into a [`status::Status`], keeps a
//! short rolling history and raises debounced alerts when the connection
//! degrades or recovers.

pub mod config;
pub mod db;
pub mod host;
pub mod monitor;
pub mod notify;
pub mod probe;
pub mod settings;
pub mod status;
pub mod web;
