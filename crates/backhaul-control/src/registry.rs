//! Live endpoint registry with round-robin rotation
//!
//! One registry exists per logical service. Endpoints keep their insertion
//! order and are handed out one at a time through a circular cursor, so
//! every live backend sees its fair share of connections. Membership changes
//! and cursor movement happen under a single mutex: a removal that lands
//! between two dispatches must leave the cursor on a surviving endpoint.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use backhaul_proto::{Announcement, ServiceConfig};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("endpoint with pid {pid} is already registered and live")]
    DuplicateKey { pid: u32 },
}

/// One live backend instance of a logical service
#[derive(Debug)]
pub struct Endpoint {
    /// Process id of the announcing backend; the registry key.
    pub pid: u32,
    /// Local port where the backend's tunnel accepts dispatched traffic.
    pub listen_port: u32,
    /// Remote peer on the far side of the tunnel, for logs and hooks.
    pub remote_addr: String,
    pub remote_port: u32,
    /// Operator-supplied metadata carried in the announcement.
    pub config: ServiceConfig,
    pub uid: u32,
    pub uname: String,
    pub registered_at: DateTime<Utc>,
}

impl Endpoint {
    pub fn from_announcement(announcement: Announcement) -> Self {
        Self {
            pid: announcement.pid,
            listen_port: announcement.listen_port,
            remote_addr: announcement.remote_addr,
            remote_port: announcement.remote_port,
            config: announcement.config,
            uid: announcement.uid,
            uname: announcement.uname,
            registered_at: Utc::now(),
        }
    }

    /// Loopback address proxied connections are dispatched to.
    pub fn dispatch_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.listen_port as u16)
    }
}

/// Insertion-ordered endpoint registry with a round-robin cursor
pub struct EndpointRegistry {
    service: String,
    inner: Mutex<RegistryInner>,
}

struct RegistryInner {
    endpoints: HashMap<u32, Arc<Endpoint>>,
    /// Registry keys in insertion order; drives the rotation.
    order: Vec<u32>,
    /// Index into `order` of the endpoint the next dispatch returns.
    cursor: usize,
}

impl EndpointRegistry {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            inner: Mutex::new(RegistryInner {
                endpoints: HashMap::new(),
                order: Vec::new(),
                cursor: 0,
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Register an endpoint at the tail of the rotation.
    ///
    /// A pid that is already registered and live means the announcing side
    /// is misbehaving; the existing entry is kept and the new one rejected.
    pub fn add(&self, endpoint: Endpoint) -> Result<Arc<Endpoint>, RegistryError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.endpoints.contains_key(&endpoint.pid) {
            tracing::warn!(
                service = %self.service,
                pid = endpoint.pid,
                "Rejected announcement for an already registered pid"
            );
            return Err(RegistryError::DuplicateKey { pid: endpoint.pid });
        }

        let endpoint = Arc::new(endpoint);
        inner.order.push(endpoint.pid);
        inner.endpoints.insert(endpoint.pid, endpoint.clone());

        tracing::info!(
            service = %self.service,
            pid = endpoint.pid,
            dispatch = %endpoint.dispatch_addr(),
            "Registered new endpoint"
        );

        Ok(endpoint)
    }

    /// Remove the endpoint registered under `pid`.
    ///
    /// Removing an absent key is a no-op. When the removed endpoint was the
    /// cursor's current target, the cursor ends up on the next survivor.
    pub fn remove(&self, pid: u32) -> Option<Arc<Endpoint>> {
        let mut inner = self.inner.lock().unwrap();
        let endpoint = inner.remove_key(pid)?;
        tracing::info!(service = %self.service, pid, "Removed endpoint");
        Some(endpoint)
    }

    /// Remove `endpoint` only if it is still the instance registered under
    /// its pid.
    ///
    /// Death-signal removal and dial-failure eviction can race each other,
    /// or race a successor announced under a recycled pid. Checking instance
    /// identity makes the losing removal a no-op.
    pub fn remove_entry(&self, endpoint: &Arc<Endpoint>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let is_current = inner
            .endpoints
            .get(&endpoint.pid)
            .map(|current| Arc::ptr_eq(current, endpoint))
            .unwrap_or(false);
        if !is_current {
            return false;
        }
        inner.remove_key(endpoint.pid);
        tracing::info!(service = %self.service, pid = endpoint.pid, "Removed endpoint");
        true
    }

    pub fn get(&self, pid: u32) -> Option<Arc<Endpoint>> {
        self.inner.lock().unwrap().endpoints.get(&pid).cloned()
    }

    /// Endpoint at the cursor, advancing the rotation one step.
    ///
    /// `None` means the rotation is empty and the caller should answer with
    /// its unavailability response instead of dialing.
    pub fn next(&self) -> Option<Arc<Endpoint>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.order.is_empty() {
            return None;
        }
        let pid = inner.order[inner.cursor];
        let endpoint = inner
            .endpoints
            .get(&pid)
            .cloned()
            .expect("rotation order out of sync with endpoint map");
        inner.cursor = (inner.cursor + 1) % inner.order.len();
        Some(endpoint)
    }

    /// Number of live endpoints.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of live endpoints in rotation order.
    pub fn list(&self) -> Vec<Arc<Endpoint>> {
        let inner = self.inner.lock().unwrap();
        inner
            .order
            .iter()
            .map(|pid| {
                inner
                    .endpoints
                    .get(pid)
                    .cloned()
                    .expect("rotation order out of sync with endpoint map")
            })
            .collect()
    }
}

impl RegistryInner {
    fn remove_key(&mut self, pid: u32) -> Option<Arc<Endpoint>> {
        let endpoint = self.endpoints.remove(&pid)?;
        let idx = self
            .order
            .iter()
            .position(|key| *key == pid)
            .expect("rotation order out of sync with endpoint map");
        self.order.remove(idx);

        if self.order.is_empty() {
            self.cursor = 0;
        } else if idx < self.cursor {
            // Entries after the removed slot shifted left one position; pull
            // the cursor back so it stays on the same endpoint.
            self.cursor -= 1;
        } else if self.cursor >= self.order.len() {
            // The cursor's own slot vanished off the tail; wrap around.
            self.cursor = 0;
        }

        Some(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_endpoint(pid: u32, listen_port: u32) -> Endpoint {
        Endpoint::from_announcement(Announcement {
            listen_port,
            remote_addr: "203.0.113.9".to_string(),
            remote_port: 40000 + pid,
            config: ServiceConfig::default(),
            uid: 1000,
            uname: "web".to_string(),
            pid,
        })
    }

    fn next_pid(registry: &EndpointRegistry) -> u32 {
        registry.next().expect("registry should not be empty").pid
    }

    #[test]
    fn add_and_get() {
        let registry = EndpointRegistry::new("web");
        registry.add(test_endpoint(100, 9100)).unwrap();

        let endpoint = registry.get(100).unwrap();
        assert_eq!(endpoint.listen_port, 9100);
        assert_eq!(endpoint.dispatch_addr().to_string(), "127.0.0.1:9100");
        assert!(registry.get(101).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_pid_is_rejected_and_original_kept() {
        let registry = EndpointRegistry::new("web");
        registry.add(test_endpoint(100, 9100)).unwrap();

        let result = registry.add(test_endpoint(100, 9200));
        assert!(matches!(
            result,
            Err(RegistryError::DuplicateKey { pid: 100 })
        ));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(100).unwrap().listen_port, 9100);
    }

    #[test]
    fn next_on_empty_registry_returns_none() {
        let registry = EndpointRegistry::new("web");
        assert!(registry.next().is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn next_cycles_in_insertion_order() {
        let registry = EndpointRegistry::new("web");
        for pid in [1, 2, 3] {
            registry.add(test_endpoint(pid, 9000 + pid)).unwrap();
        }

        let picked: Vec<u32> = (0..6).map(|_| next_pid(&registry)).collect();
        assert_eq!(picked, vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn full_cycle_visits_every_endpoint_once() {
        let registry = EndpointRegistry::new("web");
        for pid in [5, 6, 7, 8] {
            registry.add(test_endpoint(pid, 9000 + pid)).unwrap();
        }

        let mut picked: Vec<u32> = (0..registry.len()).map(|_| next_pid(&registry)).collect();
        picked.sort_unstable();
        assert_eq!(picked, vec![5, 6, 7, 8]);
    }

    #[test]
    fn remove_absent_pid_is_noop() {
        let registry = EndpointRegistry::new("web");
        registry.add(test_endpoint(1, 9001)).unwrap();

        assert!(registry.remove(99).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn removing_cursor_target_advances_to_survivor() {
        let registry = EndpointRegistry::new("web");
        for pid in [1, 2, 3] {
            registry.add(test_endpoint(pid, 9000 + pid)).unwrap();
        }

        assert_eq!(next_pid(&registry), 1);
        // Cursor now points at pid 2; removing it must not skip pid 3.
        registry.remove(2).unwrap();
        assert_eq!(next_pid(&registry), 3);
        assert_eq!(next_pid(&registry), 1);
    }

    #[test]
    fn removing_before_cursor_keeps_rotation_position() {
        let registry = EndpointRegistry::new("web");
        for pid in [1, 2, 3] {
            registry.add(test_endpoint(pid, 9000 + pid)).unwrap();
        }

        assert_eq!(next_pid(&registry), 1);
        assert_eq!(next_pid(&registry), 2);
        registry.remove(1).unwrap();
        assert_eq!(next_pid(&registry), 3);
        assert_eq!(next_pid(&registry), 2);
    }

    #[test]
    fn removing_tail_at_cursor_wraps_to_head() {
        let registry = EndpointRegistry::new("web");
        for pid in [1, 2, 3] {
            registry.add(test_endpoint(pid, 9000 + pid)).unwrap();
        }

        assert_eq!(next_pid(&registry), 1);
        assert_eq!(next_pid(&registry), 2);
        // Cursor points at the tail entry; removing it wraps the rotation.
        registry.remove(3).unwrap();
        assert_eq!(next_pid(&registry), 1);
        assert_eq!(next_pid(&registry), 2);
    }

    #[test]
    fn drain_to_empty_then_refill() {
        let registry = EndpointRegistry::new("web");
        registry.add(test_endpoint(1, 9001)).unwrap();

        assert_eq!(next_pid(&registry), 1);
        registry.remove(1).unwrap();
        assert!(registry.next().is_none());

        registry.add(test_endpoint(2, 9002)).unwrap();
        assert_eq!(next_pid(&registry), 2);
    }

    #[test]
    fn remove_entry_only_removes_the_same_instance() {
        let registry = EndpointRegistry::new("web");
        let first = registry.add(test_endpoint(7, 9001)).unwrap();
        registry.remove(7).unwrap();

        // Same pid announced again: a different instance.
        let second = registry.add(test_endpoint(7, 9002)).unwrap();
        assert!(!registry.remove_entry(&first));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove_entry(&second));
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_entry_twice_is_noop() {
        let registry = EndpointRegistry::new("web");
        let endpoint = registry.add(test_endpoint(7, 9001)).unwrap();

        assert!(registry.remove_entry(&endpoint));
        assert!(!registry.remove_entry(&endpoint));
        assert!(registry.is_empty());
    }

    #[test]
    fn list_preserves_insertion_order() {
        let registry = EndpointRegistry::new("web");
        for pid in [3, 1, 2] {
            registry.add(test_endpoint(pid, 9000 + pid)).unwrap();
        }

        let pids: Vec<u32> = registry.list().iter().map(|e| e.pid).collect();
        assert_eq!(pids, vec![3, 1, 2]);
    }
}
