//! pmtud-core — wire formats and configuration for the PMTU relay daemon.
//!
//! Everything in this crate is socket-free and async-free: fixed-offset
//! packet parsing, link-layer frame construction, and the daemon
//! configuration. The daemon crate owns all I/O.

pub mod config;
pub mod wire;
