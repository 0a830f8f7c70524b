//! Per-service control context
//!
//! A [`Service`] ties together everything one logical service needs: the
//! endpoint registry, the liveness monitor, lifecycle notifications, and the
//! watcher tasks. The announcement listener and the proxy server share a
//! service through an `Arc` and never talk to each other directly.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use backhaul_proto::Announcement;

use crate::events::{EndpointEvent, EndpointEvents, RemovalReason};
use crate::liveness::LivenessMonitor;
use crate::registry::{Endpoint, EndpointRegistry, RegistryError};
use crate::watchers::WatcherSet;

/// Tunables for one logical service
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// How long a backend may take to deliver its whole announcement before
    /// the control connection is dropped.
    pub announce_timeout: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            announce_timeout: Duration::from_secs(10),
        }
    }
}

/// One logical service: a named group of interchangeable backends
pub struct Service {
    name: String,
    registry: Arc<EndpointRegistry>,
    monitor: Arc<dyn LivenessMonitor>,
    events: EndpointEvents,
    watchers: WatcherSet,
    settings: ServiceSettings,
}

impl Service {
    pub fn new(name: impl Into<String>, monitor: Arc<dyn LivenessMonitor>) -> Self {
        let name = name.into();
        Self {
            registry: Arc::new(EndpointRegistry::new(name.clone())),
            name,
            monitor,
            events: EndpointEvents::default(),
            watchers: WatcherSet::new(),
            settings: ServiceSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: ServiceSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    /// Subscribe to endpoint lifecycle notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<EndpointEvent> {
        self.events.subscribe()
    }

    /// Register an announced backend and start watching its liveness.
    pub fn register(
        self: &Arc<Self>,
        announcement: Announcement,
    ) -> Result<Arc<Endpoint>, RegistryError> {
        let endpoint = self
            .registry
            .add(Endpoint::from_announcement(announcement))?;
        self.events.publish(EndpointEvent::Added(endpoint.clone()));

        let service = self.clone();
        let watched = endpoint.clone();
        let handle = tokio::spawn(async move {
            watch_endpoint(service, watched).await;
        });
        self.watchers.register(&endpoint, handle);

        Ok(endpoint)
    }

    /// Take an endpoint instance out of rotation, firing the removed
    /// notification.
    ///
    /// Returns false when this exact instance is no longer registered, which
    /// makes racing removals (death signal vs dial-failure eviction) safe.
    pub fn deregister(&self, endpoint: &Arc<Endpoint>, reason: RemovalReason) -> bool {
        if !self.registry.remove_entry(endpoint) {
            debug!(
                service = %self.name,
                pid = endpoint.pid,
                reason = %reason,
                "Endpoint already deregistered"
            );
            return false;
        }
        self.events.publish(EndpointEvent::Removed {
            endpoint: endpoint.clone(),
            reason,
        });
        self.watchers.unregister(endpoint);
        true
    }

    /// Abort all lifecycle watchers; part of gateway teardown.
    pub fn shutdown(&self) {
        self.watchers.abort_all();
    }

    #[cfg(test)]
    pub(crate) fn watcher_count(&self) -> usize {
        self.watchers.len()
    }
}

/// Block on the endpoint's death signal, then take it out of rotation.
async fn watch_endpoint(service: Arc<Service>, endpoint: Arc<Endpoint>) {
    let reason = match service.monitor.wait_released(endpoint.pid).await {
        Ok(()) => RemovalReason::LockReleased,
        Err(e) => {
            warn!(
                service = %service.name,
                pid = endpoint.pid,
                error = %e,
                "Liveness watch failed, deregistering endpoint"
            );
            RemovalReason::WatchFailed
        }
    };
    service.deregister(&endpoint, reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::LivenessError;
    use async_trait::async_trait;
    use std::path::PathBuf;

    /// Monitor whose wait never returns, like a backend that never dies.
    struct NeverReleases;

    #[async_trait]
    impl LivenessMonitor for NeverReleases {
        async fn wait_released(&self, _pid: u32) -> Result<(), LivenessError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    /// Monitor whose wait fails outright, like a missing lock file.
    struct BrokenMonitor;

    #[async_trait]
    impl LivenessMonitor for BrokenMonitor {
        async fn wait_released(&self, _pid: u32) -> Result<(), LivenessError> {
            Err(LivenessError::Open {
                path: PathBuf::from("/nonexistent/4242"),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no lock file"),
            })
        }
    }

    fn test_announcement(pid: u32) -> Announcement {
        Announcement {
            pid,
            listen_port: 9000 + pid,
            uname: "web".to_string(),
            ..Announcement::default()
        }
    }

    #[tokio::test]
    async fn register_fires_added_event_and_starts_watcher() {
        let service = Arc::new(Service::new("web", Arc::new(NeverReleases)));
        let mut events = service.subscribe();

        service.register(test_announcement(1)).unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            EndpointEvent::Added(endpoint) if endpoint.pid == 1
        ));
        assert_eq!(service.registry().len(), 1);
        assert_eq!(service.watcher_count(), 1);
    }

    #[tokio::test]
    async fn deregister_fires_removed_exactly_once() {
        let service = Arc::new(Service::new("web", Arc::new(NeverReleases)));
        let mut events = service.subscribe();

        let endpoint = service.register(test_announcement(1)).unwrap();
        assert!(service.deregister(&endpoint, RemovalReason::DialFailed));
        assert!(!service.deregister(&endpoint, RemovalReason::LockReleased));

        assert!(matches!(
            events.recv().await.unwrap(),
            EndpointEvent::Added(_)
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            EndpointEvent::Removed { reason: RemovalReason::DialFailed, .. }
        ));
        assert!(events.try_recv().is_err());
        assert!(service.registry().is_empty());
        assert_eq!(service.watcher_count(), 0);
    }

    #[tokio::test]
    async fn broken_watch_still_deregisters() {
        let service = Arc::new(Service::new("web", Arc::new(BrokenMonitor)));
        let mut events = service.subscribe();

        service.register(test_announcement(1)).unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            EndpointEvent::Added(_)
        ));
        let removed = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("removal event should fire")
            .unwrap();
        assert!(matches!(
            removed,
            EndpointEvent::Removed { reason: RemovalReason::WatchFailed, .. }
        ));
        assert!(service.registry().is_empty());
    }

    #[tokio::test]
    async fn shutdown_aborts_all_watchers() {
        let service = Arc::new(Service::new("web", Arc::new(NeverReleases)));
        for pid in [1, 2, 3] {
            service.register(test_announcement(pid)).unwrap();
        }
        assert_eq!(service.watcher_count(), 3);

        service.shutdown();
        assert_eq!(service.watcher_count(), 0);
    }
}
