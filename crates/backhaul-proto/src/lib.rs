//! Backhaul Protocol Definitions
//!
//! This crate defines the announcement wire format backends send over the
//! per-service control socket, and the run-directory path conventions shared
//! by the gateway and the tunnel-side tooling.

pub mod announce;
pub mod paths;

pub use announce::{Announcement, DecodeError, ServiceConfig, MAX_ANNOUNCEMENT_BYTES};
pub use paths::{control_socket_path, liveness_lock_path, DEFAULT_RUN_DIR};
