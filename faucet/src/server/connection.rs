use anyhow::Result;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant};

use super::handlers::send_error;
use super::FaucetServer;
use crate::error::FaucetError;
use crate::metrics::prometheus as metrics;
use crate::protocol::{ClientHandle, ClientMessage, ServerMessage};

/// IPv4-mapped IPv6 peers count as their IPv4 address
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

/// Per-connection state owned by the connection task
#[derive(Debug)]
pub struct Connection {
    pub conn_id: u64,
    pub peer_addr: SocketAddr,
    pub client: ClientHandle,
    pub client_version: Option<String>,
    connected_at: Instant,
    last_ping_pong: Instant,
}

impl Connection {
    pub fn new(conn_id: u64, peer_addr: SocketAddr, client: ClientHandle) -> Self {
        let now = Instant::now();
        Self {
            conn_id,
            peer_addr,
            client,
            client_version: None,
            connected_at: now,
            last_ping_pong: now,
        }
    }

    pub fn remote_ip(&self) -> IpAddr {
        canonical_ip(self.peer_addr.ip())
    }

    /// Any inbound line proves the client is alive
    pub fn touch(&mut self) {
        self.last_ping_pong = Instant::now();
    }

    pub fn since_ping_pong(&self) -> Duration {
        self.last_ping_pong.elapsed()
    }

    pub fn uptime(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Tell the client why it is being dropped
    pub fn kill(&self, reason: &str) {
        send_error(&self.client, "kill", &FaucetError::ClientKilled(reason.to_string()), None);
    }
}

impl FaucetServer {
    /// Drive one client connection until it closes or gets killed
    pub(super) async fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        let conn_id = self.next_conn_id();
        let _ = socket.set_nodelay(true);
        let (reader, mut writer) = socket.into_split();

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let (close_tx, mut close_rx) = oneshot::channel::<()>();
        let mut conn = Connection::new(conn_id, peer_addr, ClientHandle::new(conn_id, tx));

        tracing::info!("🔌 Connection {} from {}", conn_id, peer_addr);
        metrics::inc_connections();

        // Writer drains the queue until told to close, then flushes what is left
        let writer_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(line) => {
                            if writer.write_all(line.as_bytes()).await.is_err() {
                                return;
                            }
                        }
                        None => break,
                    },
                    _ = &mut close_rx => {
                        while let Ok(line) = rx.try_recv() {
                            if writer.write_all(line.as_bytes()).await.is_err() {
                                return;
                            }
                        }
                        break;
                    }
                }
            }
            let _ = writer.shutdown().await;
        });

        let ping_every = self.config.ping_interval();
        let mut ping = interval_at(Instant::now() + ping_every, ping_every);
        let mut lines = BufReader::new(reader).lines();

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        conn.touch();
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let message: ClientMessage = match serde_json::from_str(line) {
                            Ok(message) => message,
                            Err(e) => {
                                tracing::debug!("Connection {} sent an invalid message: {}", conn_id, e);
                                conn.kill("invalid message");
                                break;
                            }
                        };
                        self.dispatch(&mut conn, message).await;
                    }
                    Ok(None) => {
                        tracing::debug!("Connection {} closed by client", conn_id);
                        break;
                    }
                    Err(e) => {
                        tracing::debug!("Connection {} read error: {}", conn_id, e);
                        break;
                    }
                },
                _ = ping.tick() => {
                    let timeout = self.config.ping_timeout();
                    if !timeout.is_zero() && conn.since_ping_pong() > timeout {
                        tracing::info!("⏱️ Connection {} missed its pings, dropping", conn_id);
                        conn.kill("ping timeout");
                        break;
                    }
                    conn.client.send(&ServerMessage::push("ping", serde_json::Value::Null));
                }
            }
        }

        self.sessions.disconnect(conn_id).await;
        let _ = close_tx.send(());
        let _ = writer_task.await;
        metrics::dec_connections();
        tracing::info!(
            "👋 Connection {} from {} (client {}) closed after {:?}",
            conn_id,
            peer_addr,
            conn.client_version.as_deref().unwrap_or("unknown"),
            conn.uptime()
        );
        Ok(())
    }
}
