//! Per-service announcement listener
//!
//! Each logical service exposes one Unix domain socket in the run directory.
//! A backend connects, writes a single JSON announcement, and closes its
//! write side; the listener reads to end-of-stream, decodes, registers the
//! endpoint, and starts its lifecycle watcher. Bad peers cost one dropped
//! connection, never the listener.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use backhaul_proto::{Announcement, MAX_ANNOUNCEMENT_BYTES};

use crate::service::Service;

/// Control channel errors
///
/// Each of these stops the service from onboarding new backends; the
/// supervisor decides what happens to the service after that.
#[derive(Debug, Error)]
pub enum ControlChannelError {
    #[error("failed to create run directory {path}: {source}")]
    CreateRunDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("another gateway is already serving {path}")]
    AlreadyServing { path: PathBuf },

    #[error("failed to bind control socket {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("control socket accept failed: {0}")]
    Accept(#[source] std::io::Error),
}

/// Listener for backend announcements of one logical service
pub struct AnnounceListener {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl AnnounceListener {
    /// Bind the control socket at `<run-dir>/<service>.sock`.
    ///
    /// A socket file left behind by a dead gateway is replaced; one with a
    /// live listener behind it means another instance owns this service.
    pub async fn bind(run_dir: &Path, service: &str) -> Result<Self, ControlChannelError> {
        std::fs::create_dir_all(run_dir).map_err(|source| ControlChannelError::CreateRunDir {
            path: run_dir.to_path_buf(),
            source,
        })?;

        let socket_path = backhaul_proto::control_socket_path(run_dir, service);
        if socket_path.exists() {
            match UnixStream::connect(&socket_path).await {
                Ok(_) => {
                    return Err(ControlChannelError::AlreadyServing { path: socket_path });
                }
                Err(_) => {
                    debug!(path = %socket_path.display(), "Removing stale control socket");
                    std::fs::remove_file(&socket_path).map_err(|source| {
                        ControlChannelError::Bind {
                            path: socket_path.clone(),
                            source,
                        }
                    })?;
                }
            }
        }

        let listener =
            UnixListener::bind(&socket_path).map_err(|source| ControlChannelError::Bind {
                path: socket_path.clone(),
                source,
            })?;

        info!(path = %socket_path.display(), "Control socket listening");

        Ok(Self {
            listener,
            socket_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept announcements until the control channel itself fails.
    ///
    /// Per-connection problems drop the offending connection and keep
    /// accepting; an accept error is fatal and handed to the supervisor.
    pub async fn run(self, service: Arc<Service>) -> Result<(), ControlChannelError> {
        loop {
            let (stream, _) = self
                .listener
                .accept()
                .await
                .map_err(ControlChannelError::Accept)?;
            let service = service.clone();
            tokio::spawn(async move {
                handle_announcement(stream, service).await;
            });
        }
    }
}

impl Drop for AnnounceListener {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

async fn handle_announcement(stream: UnixStream, service: Arc<Service>) {
    let timeout = service.settings().announce_timeout;
    let payload = match tokio::time::timeout(timeout, read_payload(stream)).await {
        Ok(Ok(payload)) => payload,
        Ok(Err(e)) => {
            warn!(service = %service.name(), error = %e, "Failed to read announcement");
            return;
        }
        Err(_) => {
            warn!(
                service = %service.name(),
                timeout_secs = timeout.as_secs(),
                "Announcement not completed in time, dropping connection"
            );
            return;
        }
    };

    let announcement = match Announcement::from_slice(&payload) {
        Ok(announcement) => announcement,
        Err(e) => {
            warn!(service = %service.name(), error = %e, "Dropping malformed announcement");
            return;
        }
    };

    if announcement.pid == 0
        || announcement.listen_port == 0
        || announcement.listen_port > u16::MAX as u32
    {
        warn!(
            service = %service.name(),
            pid = announcement.pid,
            listen_port = announcement.listen_port,
            "Dropping announcement with unusable pid or listen port"
        );
        return;
    }

    debug!(
        service = %service.name(),
        pid = announcement.pid,
        listen_port = announcement.listen_port,
        "Announcement received"
    );

    if let Err(e) = service.register(announcement) {
        warn!(service = %service.name(), error = %e, "Announcement rejected");
    }
}

/// Read the whole announcement; the peer closing its write side marks the
/// end of the payload.
async fn read_payload(mut stream: UnixStream) -> std::io::Result<Vec<u8>> {
    let mut payload = Vec::new();
    // One byte over the cap is enough for the decoder to reject it.
    let limit = (MAX_ANNOUNCEMENT_BYTES + 1) as u64;
    (&mut stream).take(limit).read_to_end(&mut payload).await?;
    Ok(payload)
}
