//! Public TCP entry point for one logical service
//!
//! Accepts inbound connections, picks the next live endpoint from the
//! rotation, dials its dispatch address, and hands the pair to the byte
//! relay. An endpoint that cannot be dialed is evicted on the spot and the
//! connection moves on to the next candidate; every endpoint that was live
//! when the connection arrived gets at most one attempt.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use backhaul_control::{RemovalReason, Service};

use crate::relay::relay;

/// Sent verbatim to clients when no live endpoint can take their connection.
pub const NO_ROUTES_RESPONSE: &[u8] = b"No Routes available.";

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    pub bind_addr: SocketAddr,
}

pub struct ProxyServer {
    listener: TcpListener,
    service: Arc<Service>,
}

impl ProxyServer {
    /// Bind the public listener for one logical service.
    pub async fn bind(
        config: ProxyServerConfig,
        service: Arc<Service>,
    ) -> Result<Self, ProxyError> {
        let listener = bind_with_retry(config.bind_addr).await?;
        Ok(Self { listener, service })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and dispatch connections until the task is aborted.
    pub async fn run(self) -> Result<(), ProxyError> {
        let addr = self.listener.local_addr()?;
        info!(
            "Proxy server listening on {} for service {}",
            addr,
            self.service.name()
        );

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!(
                        "New connection from {} for service {}",
                        peer_addr,
                        self.service.name()
                    );

                    let service = self.service.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer_addr, service).await {
                            error!("Error handling connection from {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

async fn bind_with_retry(bind_addr: SocketAddr) -> Result<TcpListener, ProxyError> {
    // Retry bind logic to ride out TIME_WAIT from a previous instance (up to 3 attempts with 1 second delays)
    for attempt in 1..=3 {
        match TcpListener::bind(&bind_addr).await {
            Ok(listener) => {
                if attempt > 1 {
                    info!("Successfully bound to {} on attempt {}/3", bind_addr, attempt);
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < 3 => {
                warn!(
                    "Port {} is in use (attempt {}/3, may be in TIME_WAIT state), retrying in 1 second...",
                    bind_addr.port(),
                    attempt
                );
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
            Err(e) => {
                return Err(ProxyError::BindError {
                    address: bind_addr.ip().to_string(),
                    port: bind_addr.port(),
                    reason: e.to_string(),
                });
            }
        }
    }

    Err(ProxyError::BindError {
        address: bind_addr.ip().to_string(),
        port: bind_addr.port(),
        reason: "Address in use after 3 retry attempts".to_string(),
    })
}

async fn handle_connection(
    mut client: TcpStream,
    peer_addr: SocketAddr,
    service: Arc<Service>,
) -> Result<(), ProxyError> {
    // Every endpoint live at arrival gets one dial attempt, no more; a
    // rotation where every dial fails must not spin forever.
    let mut budget = service.registry().len();

    while budget > 0 {
        let endpoint = match service.registry().next() {
            Some(endpoint) => endpoint,
            None => break,
        };

        let dispatch_addr = endpoint.dispatch_addr();
        match TcpStream::connect(dispatch_addr).await {
            Ok(backend) => {
                debug!(
                    "Relaying {} to {} (pid {}) for service {}",
                    peer_addr,
                    dispatch_addr,
                    endpoint.pid,
                    service.name()
                );
                relay(client, backend).await;
                return Ok(());
            }
            Err(e) => {
                warn!(
                    "Failed to dial {} (pid {}) for service {}: {}, evicting endpoint",
                    dispatch_addr,
                    endpoint.pid,
                    service.name(),
                    e
                );
                service.deregister(&endpoint, RemovalReason::DialFailed);
                budget -= 1;
            }
        }
    }

    debug!(
        "No live endpoints for service {}, refusing {}",
        service.name(),
        peer_addr
    );
    client.write_all(NO_ROUTES_RESPONSE).await?;
    client.shutdown().await?;
    Ok(())
}
