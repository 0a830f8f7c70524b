//! Endpoint lifecycle notifications

use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::registry::Endpoint;

/// Why an endpoint left the rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// The backend's liveness lock was released: its process exited.
    LockReleased,
    /// The gateway failed to dial the backend's dispatch address.
    DialFailed,
    /// The liveness watch itself failed, so the backend can no longer be
    /// tracked and was deregistered.
    WatchFailed,
}

impl RemovalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemovalReason::LockReleased => "lock_released",
            RemovalReason::DialFailed => "dial_failed",
            RemovalReason::WatchFailed => "watch_failed",
        }
    }
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle notification for one endpoint
#[derive(Debug, Clone)]
pub enum EndpointEvent {
    Added(Arc<Endpoint>),
    Removed {
        endpoint: Arc<Endpoint>,
        reason: RemovalReason,
    },
}

/// Per-service broadcast channel for endpoint events
#[derive(Debug, Clone)]
pub struct EndpointEvents {
    sender: broadcast::Sender<EndpointEvent>,
}

impl EndpointEvents {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EndpointEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Dropped silently when nobody is subscribed; the
    /// registry stays authoritative either way.
    pub fn publish(&self, event: EndpointEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EndpointEvents {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_proto::Announcement;

    fn test_endpoint(pid: u32) -> Arc<Endpoint> {
        Arc::new(Endpoint::from_announcement(Announcement {
            pid,
            listen_port: 9000,
            ..Announcement::default()
        }))
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let events = EndpointEvents::default();
        events.publish(EndpointEvent::Added(test_endpoint(1)));
    }

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let events = EndpointEvents::default();
        let mut receiver = events.subscribe();

        events.publish(EndpointEvent::Added(test_endpoint(1)));
        events.publish(EndpointEvent::Removed {
            endpoint: test_endpoint(1),
            reason: RemovalReason::LockReleased,
        });

        assert!(matches!(
            receiver.recv().await.unwrap(),
            EndpointEvent::Added(endpoint) if endpoint.pid == 1
        ));
        assert!(matches!(
            receiver.recv().await.unwrap(),
            EndpointEvent::Removed { reason: RemovalReason::LockReleased, .. }
        ));
    }
}
