//! Wayproxy - web archive replay/record proxy.
//!
//! This crate backs the `wayproxy` binary: configuration loading and the
//! collection management commands. The proxy itself lives in
//! `wayproxy-proxy`.

pub mod commands;
