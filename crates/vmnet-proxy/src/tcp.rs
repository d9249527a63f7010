use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::io;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// A TCP port relay: accepts connections on the listen address and pipes
/// each one to the target VM.
///
/// This is a Layer 4 relay — no application-layer inspection. Bytes flow
/// verbatim in both directions until either side closes the connection.
pub struct TcpRelay {
    listener: TcpListener,
    target: SocketAddr,
}

impl TcpRelay {
    pub async fn bind(listen: SocketAddr, target: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("Failed to bind TCP relay on {}", listen))?;
        info!(listen = %listen, target = %target, "TCP relay listening");
        Ok(Self { listener, target })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read relay listen address")
    }

    /// Accept until the shutdown signal fires or the listener fails. Each
    /// connection gets its own task; in-flight connections are not torn down
    /// when the loop exits. A listener-level error stops only this relay.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let target = self.target;
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            tokio::spawn(async move {
                                if let Err(e) = relay_connection(stream, peer, target).await {
                                    warn!(peer = %peer, target = %target, error = %e, "TCP relay error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(target = %target, error = %e, "Accept error, stopping relay");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    debug!(target = %target, "TCP relay shutting down");
                    break;
                }
            }
        }
    }
}

async fn relay_connection(
    mut client: TcpStream,
    peer: SocketAddr,
    target: SocketAddr,
) -> Result<()> {
    let mut upstream = TcpStream::connect(target)
        .await
        .with_context(|| format!("Failed to connect to {}", target))?;

    let (sent, received) = io::copy_bidirectional(&mut client, &mut upstream)
        .await
        .context("Relay connection error")?;

    debug!(peer = %peer, sent, received, "Connection closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn spawn_echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1024];
                    let n = stream.read(&mut buf).await.unwrap();
                    stream.write_all(&buf[..n]).await.unwrap();
                    stream.shutdown().await.unwrap();
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_relay_forwards_both_directions() {
        let target = spawn_echo_server().await;
        let relay = TcpRelay::bind("127.0.0.1:0".parse().unwrap(), target)
            .await
            .unwrap();
        let relay_addr = relay.local_addr().unwrap();

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(relay.run(shutdown_rx));

        let mut client = TcpStream::connect(relay_addr).await.unwrap();
        client.write_all(b"hello vm").await.unwrap();
        client.shutdown().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"hello vm");
    }

    #[tokio::test]
    async fn test_relay_handles_concurrent_connections() {
        let target = spawn_echo_server().await;
        let relay = TcpRelay::bind("127.0.0.1:0".parse().unwrap(), target)
            .await
            .unwrap();
        let relay_addr = relay.local_addr().unwrap();

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(relay.run(shutdown_rx));

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            tasks.push(tokio::spawn(async move {
                let mut client = TcpStream::connect(relay_addr).await.unwrap();
                let payload = vec![i; 64];
                client.write_all(&payload).await.unwrap();
                client.shutdown().await.unwrap();
                let mut response = Vec::new();
                client.read_to_end(&mut response).await.unwrap();
                assert_eq!(response, payload);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_relay_stops_accepting_after_shutdown() {
        let target = spawn_echo_server().await;
        let relay = TcpRelay::bind("127.0.0.1:0".parse().unwrap(), target)
            .await
            .unwrap();
        let relay_addr = relay.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(relay.run(shutdown_rx));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        // The listener is dropped with the task; new connections are refused.
        assert!(TcpStream::connect(relay_addr).await.is_err());
    }
}
