//! Backhaul Proxy
//!
//! Public-facing TCP servers that dispatch inbound connections across the
//! live endpoints of a logical service, round robin, and relay bytes
//! transparently in both directions.

pub mod relay;
pub mod server;

pub use server::{ProxyError, ProxyServer, ProxyServerConfig, NO_ROUTES_RESPONSE};
