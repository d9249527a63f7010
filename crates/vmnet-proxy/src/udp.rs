use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MAX_DATAGRAM: usize = 64 * 1024;

/// A UDP port relay with per-client sessions.
///
/// UDP has no connections, so the relay synthesizes them: the first datagram
/// from a client address opens a session with its own upstream socket, and
/// replies from the target are sent back to that client. A session with no
/// traffic in either direction for the idle timeout is evicted, closing its
/// upstream socket.
pub struct UdpRelay {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    idle_timeout: Duration,
}

struct Session {
    upstream: Arc<UdpSocket>,
    last_seen: Arc<Mutex<Instant>>,
    task: JoinHandle<()>,
}

impl UdpRelay {
    pub async fn bind(
        listen: SocketAddr,
        target: SocketAddr,
        idle_timeout: Duration,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(listen)
            .await
            .with_context(|| format!("Failed to bind UDP relay on {}", listen))?;
        info!(listen = %listen, target = %target, "UDP relay listening");
        Ok(Self {
            socket: Arc::new(socket),
            target,
            idle_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .context("Failed to read relay listen address")
    }

    /// Relay datagrams until the shutdown signal fires, then close every
    /// session's upstream socket and release the inbound socket.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut sessions: HashMap<SocketAddr, Session> = HashMap::new();
        let (expired_tx, mut expired_rx) = mpsc::unbounded_channel::<SocketAddr>();
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = match result {
                        Ok(received) => received,
                        Err(e) => {
                            warn!(error = %e, "UDP receive error");
                            continue;
                        }
                    };
                    if !sessions.contains_key(&peer) {
                        match self.open_session(peer, expired_tx.clone(), shutdown.clone()).await {
                            Ok(session) => {
                                debug!(peer = %peer, target = %self.target, "UDP session opened");
                                sessions.insert(peer, session);
                            }
                            Err(e) => {
                                warn!(peer = %peer, error = %e, "Failed to open UDP session");
                                continue;
                            }
                        }
                    }
                    // Present after the insert above.
                    if let Some(session) = sessions.get(&peer) {
                        if let Ok(mut last_seen) = session.last_seen.lock() {
                            *last_seen = Instant::now();
                        }
                        if let Err(e) = session.upstream.send(&buf[..len]).await {
                            warn!(peer = %peer, error = %e, "UDP forward error");
                            sessions.remove(&peer);
                        }
                    }
                }
                Some(peer) = expired_rx.recv() => {
                    if sessions.remove(&peer).is_some() {
                        debug!(peer = %peer, "UDP session evicted");
                    }
                }
                _ = shutdown.changed() => {
                    debug!(target = %self.target, sessions = sessions.len(), "UDP relay shutting down");
                    break;
                }
            }
        }

        // Wait for every return task so all clones of the inbound socket are
        // dropped and the public port is free once `run` returns.
        for (_, session) in sessions.drain() {
            let _ = session.task.await;
        }
    }

    /// Open the upstream socket for one client and spawn its return task.
    /// The task pumps replies back to the client and exits, dropping the
    /// upstream socket, once the session has been idle for the timeout or
    /// the relay shuts down.
    async fn open_session(
        &self,
        peer: SocketAddr,
        expired_tx: mpsc::UnboundedSender<SocketAddr>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<Session> {
        let upstream = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("Failed to bind upstream socket")?;
        upstream
            .connect(self.target)
            .await
            .with_context(|| format!("Failed to connect upstream to {}", self.target))?;

        let upstream = Arc::new(upstream);
        let last_seen = Arc::new(Mutex::new(Instant::now()));

        let task_upstream = Arc::clone(&upstream);
        let task_last_seen = Arc::clone(&last_seen);
        let inbound = Arc::clone(&self.socket);
        let idle = self.idle_timeout;
        let task = tokio::spawn(async move {
            let upstream = task_upstream;
            let last_seen = task_last_seen;
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    result = tokio::time::timeout(idle, upstream.recv(&mut buf)) => match result {
                        Ok(Ok(len)) => {
                            if let Ok(mut seen) = last_seen.lock() {
                                *seen = Instant::now();
                            }
                            if let Err(e) = inbound.send_to(&buf[..len], peer).await {
                                debug!(peer = %peer, error = %e, "UDP return error");
                                break;
                            }
                        }
                        Ok(Err(e)) => {
                            debug!(peer = %peer, error = %e, "UDP upstream closed");
                            break;
                        }
                        Err(_) => {
                            let idle_for = last_seen
                                .lock()
                                .map(|seen| seen.elapsed())
                                .unwrap_or(idle);
                            if idle_for >= idle {
                                break;
                            }
                        }
                    },
                    _ = shutdown.changed() => break,
                }
            }
            let _ = expired_tx.send(peer);
        });

        Ok(Session {
            upstream,
            last_seen,
            task,
        })
    }
}
