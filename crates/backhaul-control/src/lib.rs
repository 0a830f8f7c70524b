//! Backhaul Control Plane
//!
//! Owns the per-service endpoint registry, the announcement channel backends
//! register over, and the lock-based liveness watching that takes dead
//! backends out of rotation.

#[cfg(unix)]
pub mod announce;
pub mod events;
pub mod liveness;
pub mod registry;
pub mod service;
pub mod watchers;

#[cfg(unix)]
pub use announce::{AnnounceListener, ControlChannelError};
pub use events::{EndpointEvent, EndpointEvents, RemovalReason};
#[cfg(unix)]
pub use liveness::LockFileMonitor;
pub use liveness::{LivenessError, LivenessMonitor};
pub use registry::{Endpoint, EndpointRegistry, RegistryError};
pub use service::{Service, ServiceSettings};
pub use watchers::WatcherSet;
