//! Backend announcement wire format
//!
//! A backend sends exactly one JSON-encoded [`Announcement`] after its tunnel
//! comes up, then closes its write side. The field names are the wire
//! contract with the deployed backend fleet and must not change; new fields
//! may be added, and decoders ignore fields they do not know.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on a single announcement payload.
///
/// A well-formed announcement is well under 1 KiB; anything larger is a
/// misbehaving peer and is rejected before decoding.
pub const MAX_ANNOUNCEMENT_BYTES: usize = 8 * 1024;

/// Announcement decode errors
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed announcement: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("announcement exceeds {limit} byte limit ({actual} bytes)")]
    TooLarge { limit: usize, actual: usize },
}

/// Service metadata a backend reports about itself
///
/// Mirrors the operator-supplied configuration of the spawning side: which
/// logical service port the backend serves, its instance number, and a
/// free-form label for diagnostics and hooks.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub port: u32,
    #[serde(default)]
    pub instance: u32,
    #[serde(default)]
    pub label: String,
}

/// One-shot backend announcement
///
/// Missing numeric fields decode as zero and missing strings as empty, so
/// older backends that omit newer fields keep working.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Announcement {
    /// Port on the gateway where the backend's tunnel listens; proxied
    /// traffic is dispatched to 127.0.0.1 at this port.
    #[serde(rename = "lisport", default)]
    pub listen_port: u32,

    /// IP of the remote peer behind the tunnel (diagnostics only).
    #[serde(rename = "raddr", default)]
    pub remote_addr: String,

    /// Port of the remote peer behind the tunnel (diagnostics only).
    #[serde(rename = "rport", default)]
    pub remote_port: u32,

    /// Operator-supplied service metadata.
    #[serde(default)]
    pub config: ServiceConfig,

    /// User id of the announcing process.
    #[serde(default)]
    pub uid: u32,

    /// User name of the announcing process; names the logical service.
    #[serde(default)]
    pub uname: String,

    /// Process id of the announcing process; the registry key.
    #[serde(default)]
    pub pid: u32,
}

impl Announcement {
    /// Decode an announcement from a complete payload.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() > MAX_ANNOUNCEMENT_BYTES {
            return Err(DecodeError::TooLarge {
                limit: MAX_ANNOUNCEMENT_BYTES,
                actual: bytes.len(),
            });
        }
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Encode an announcement for sending over the control socket.
    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
