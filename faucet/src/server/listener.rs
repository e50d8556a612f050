use anyhow::{anyhow, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use super::connection::canonical_ip;
use super::FaucetServer;

/// Bind a listening socket with SO_REUSEADDR so restarts don't hit "Address already in use"
pub fn bind(addr: &str) -> Result<TcpListener> {
    let sock_addr: SocketAddr = addr.parse().map_err(|e| anyhow!("Invalid address '{}': {}", addr, e))?;
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(sock_addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&socket2::SockAddr::from(sock_addr))?;
    socket.listen(1024)?;
    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}

impl FaucetServer {
    /// Bind the configured address and serve forever
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let listener = bind(&self.config.listen)?;
        tracing::info!("✅ Faucet server listening on {} (SO_REUSEADDR)", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept loop on an already bound listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((mut socket, peer_addr)) => {
                    let ip = canonical_ip(peer_addr.ip());
                    if !self.admit(ip).await {
                        let _ = socket.shutdown().await;
                        continue;
                    }

                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(socket, peer_addr).await {
                            tracing::error!("Connection error from {}: {}", peer_addr, e);
                        }
                        server.release(ip).await;
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}
