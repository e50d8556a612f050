/// Faucet TCP server
///
/// Accepts miner connections, enforces the connection limits, and routes
/// every line a client sends to the matching action handler.

pub mod connection;
pub mod handlers;
pub mod listener;

pub use connection::Connection;
pub use listener::bind;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::FaucetConfig;
use crate::payout::ClaimPipeline;
use crate::session::SessionManager;
use crate::shares::ShareVerifier;

pub struct FaucetServer {
    config: Arc<FaucetConfig>,
    sessions: Arc<SessionManager>,
    verifier: Arc<ShareVerifier>,
    claims: Arc<dyn ClaimPipeline>,
    connection_count: AtomicUsize,
    connections_per_ip: RwLock<HashMap<IpAddr, usize>>,
    next_conn_id: AtomicU64,
}

impl FaucetServer {
    pub fn new(
        config: Arc<FaucetConfig>,
        sessions: Arc<SessionManager>,
        verifier: Arc<ShareVerifier>,
        claims: Arc<dyn ClaimPipeline>,
    ) -> Self {
        tracing::info!(
            "🌐 Creating faucet server on {} (max {} connections, {} per IP)",
            config.listen,
            config.max_connections,
            config.max_connections_per_ip
        );
        Self {
            config,
            sessions,
            verifier,
            claims,
            connection_count: AtomicUsize::new(0),
            connections_per_ip: RwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &FaucetConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Relaxed)
    }

    /// Reserve a connection slot for `ip`; false when a limit is hit
    async fn admit(&self, ip: IpAddr) -> bool {
        if self.config.max_connections > 0 && self.connection_count() >= self.config.max_connections {
            tracing::warn!("🚫 Max connections ({}) reached, rejecting {}", self.config.max_connections, ip);
            return false;
        }

        let mut ip_counts = self.connections_per_ip.write().await;
        let count = ip_counts.entry(ip).or_insert(0);
        if self.config.max_connections_per_ip > 0 && *count >= self.config.max_connections_per_ip {
            tracing::warn!(
                "🚫 Per-IP limit ({}) reached for {}, rejecting",
                self.config.max_connections_per_ip,
                ip
            );
            if *count == 0 {
                ip_counts.remove(&ip);
            }
            return false;
        }
        *count += 1;
        self.connection_count.fetch_add(1, Ordering::Relaxed);
        true
    }

    async fn release(&self, ip: IpAddr) {
        let mut ip_counts = self.connections_per_ip.write().await;
        if let Some(count) = ip_counts.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                ip_counts.remove(&ip);
            }
        }
        self.connection_count.fetch_sub(1, Ordering::Relaxed);
    }

    fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }
}
