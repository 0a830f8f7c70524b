//! Bidirectional byte relay
//!
//! Two copy tasks, one per direction. The first direction to finish, whether
//! by clean EOF or error, tears the relay down: the opposite task is aborted
//! and both sockets drop. A relay closes exactly once and never inspects the
//! bytes it moves.

use tokio::net::TcpStream;
use tokio::task::JoinError;
use tracing::debug;

/// Relay bytes between a client and a backend until either direction
/// completes.
pub async fn relay(client: TcpStream, backend: TcpStream) {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut backend_read, mut backend_write) = backend.into_split();

    let client_to_backend = tokio::spawn(async move {
        tokio::io::copy(&mut client_read, &mut backend_write).await
    });
    let backend_to_client = tokio::spawn(async move {
        tokio::io::copy(&mut backend_read, &mut client_write).await
    });

    let client_to_backend_abort = client_to_backend.abort_handle();
    let backend_to_client_abort = backend_to_client.abort_handle();

    tokio::select! {
        finished = client_to_backend => {
            backend_to_client_abort.abort();
            log_direction("client to backend", finished);
        }
        finished = backend_to_client => {
            client_to_backend_abort.abort();
            log_direction("backend to client", finished);
        }
    }
}

fn log_direction(direction: &str, finished: Result<std::io::Result<u64>, JoinError>) {
    match finished {
        Ok(Ok(bytes)) => debug!("Relay finished after {} bytes ({})", bytes, direction),
        Ok(Err(e)) => debug!("Relay ended with error ({}): {}", direction, e),
        Err(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (accepted, _) = listener.accept().await.unwrap();
        (connect.await.unwrap(), accepted)
    }

    #[tokio::test]
    async fn moves_bytes_in_both_directions() {
        let (mut client, relay_client_side) = tcp_pair().await;
        let (relay_backend_side, mut backend) = tcp_pair().await;
        tokio::spawn(relay(relay_client_side, relay_backend_side));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        backend.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn backend_close_ends_the_relay_for_the_client() {
        let (mut client, relay_client_side) = tcp_pair().await;
        let (relay_backend_side, mut backend) = tcp_pair().await;
        tokio::spawn(relay(relay_client_side, relay_backend_side));

        backend.write_all(b"bye").await.unwrap();
        drop(backend);

        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut buf))
            .await
            .expect("client must see the relay close")
            .unwrap();
        assert_eq!(buf, b"bye");
    }

    #[tokio::test]
    async fn client_close_ends_the_relay_for_the_backend() {
        let (client, relay_client_side) = tcp_pair().await;
        let (relay_backend_side, mut backend) = tcp_pair().await;
        tokio::spawn(relay(relay_client_side, relay_backend_side));

        drop(client);

        let mut buf = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(5), backend.read_to_end(&mut buf))
            .await
            .expect("backend must see the relay close");
        // A clean EOF and a reset both count as the relay tearing down.
        if let Ok(n) = read {
            assert_eq!(n, 0);
        }
    }
}
