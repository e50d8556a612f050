/// Persistent session / address marks
///
/// Session marks block resume, recovery and claims after a session was
/// killed, closed or paid out. Address marks implement the claim cooldown.
///
/// Redis layout:
/// - faucet:session:{id}:marks  (set, expires)
/// - faucet:addr:{addr}:marks   (set, expires)

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionMark {
    Killed,
    Closed,
    Claimed,
}

impl SessionMark {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMark::Killed => "killed",
            SessionMark::Closed => "closed",
            SessionMark::Claimed => "claimed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "killed" => Some(SessionMark::Killed),
            "closed" => Some(SessionMark::Closed),
            "claimed" => Some(SessionMark::Claimed),
            _ => None,
        }
    }
}

impl fmt::Display for SessionMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressMark {
    Used,
}

impl AddressMark {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressMark::Used => "used",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "used" => Some(AddressMark::Used),
            _ => None,
        }
    }
}

impl fmt::Display for AddressMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Render marks as "a,b" for error messages
pub fn join_marks<T: fmt::Display>(marks: &[T]) -> String {
    marks.iter().map(|m| m.to_string()).collect::<Vec<_>>().join(",")
}

#[async_trait]
pub trait MarkStore: Send + Sync {
    async fn session_marks(&self, session_id: &str) -> Result<Vec<SessionMark>>;

    /// Returns true when the mark was not present before
    async fn set_session_mark(&self, session_id: &str, mark: SessionMark, ttl: Duration) -> Result<bool>;

    /// Undo a mark whose follow-up action failed
    async fn remove_session_mark(&self, session_id: &str, mark: SessionMark) -> Result<()>;

    async fn address_marks(&self, addr: &str) -> Result<Vec<AddressMark>>;

    async fn set_address_mark(&self, addr: &str, mark: AddressMark, ttl: Duration) -> Result<()>;
}

// ── In-memory store ─────────────────────────────────────────────────

type MarkMap<M> = HashMap<String, HashMap<M, Instant>>;

/// Writes between sweeps of expired keys
const SWEEP_EVERY: usize = 128;

/// Process-local mark store; marks vanish on restart
#[derive(Default)]
pub struct MemoryMarkStore {
    sessions: Mutex<MarkMap<SessionMark>>,
    addresses: Mutex<MarkMap<AddressMark>>,
    writes: AtomicUsize,
}

impl MemoryMarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live<M: Copy + Eq + std::hash::Hash>(map: &Mutex<MarkMap<M>>, key: &str) -> Result<Vec<M>> {
        let mut map = map.lock().map_err(|_| anyhow!("mark store poisoned"))?;
        let now = Instant::now();
        let Some(marks) = map.get_mut(key) else {
            return Ok(Vec::new());
        };
        marks.retain(|_, expires| *expires > now);
        let live = marks.keys().copied().collect();
        if marks.is_empty() {
            map.remove(key);
        }
        Ok(live)
    }

    fn insert<M: Copy + Eq + std::hash::Hash>(
        &self,
        map: &Mutex<MarkMap<M>>,
        key: &str,
        mark: M,
        ttl: Duration,
    ) -> Result<bool> {
        let mut map = map.lock().map_err(|_| anyhow!("mark store poisoned"))?;
        let now = Instant::now();
        if (self.writes.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_EVERY == 0 {
            Self::sweep(&mut map, now);
        }
        let marks = map.entry(key.to_string()).or_default();
        let fresh = marks.get(&mark).map_or(true, |expires| *expires <= now);
        marks.insert(mark, now + ttl);
        Ok(fresh)
    }

    /// Drop expired marks and keys left without any
    fn sweep<M>(map: &mut MarkMap<M>, now: Instant) {
        let before = map.len();
        map.retain(|_, marks| {
            marks.retain(|_, expires| *expires > now);
            !marks.is_empty()
        });
        if map.len() < before {
            tracing::debug!("Swept {} expired mark key(s)", before - map.len());
        }
    }
}

#[async_trait]
impl MarkStore for MemoryMarkStore {
    async fn session_marks(&self, session_id: &str) -> Result<Vec<SessionMark>> {
        Self::live(&self.sessions, session_id)
    }

    async fn set_session_mark(&self, session_id: &str, mark: SessionMark, ttl: Duration) -> Result<bool> {
        self.insert(&self.sessions, session_id, mark, ttl)
    }

    async fn remove_session_mark(&self, session_id: &str, mark: SessionMark) -> Result<()> {
        let mut map = self.sessions.lock().map_err(|_| anyhow!("mark store poisoned"))?;
        if let Some(marks) = map.get_mut(session_id) {
            marks.remove(&mark);
            if marks.is_empty() {
                map.remove(session_id);
            }
        }
        Ok(())
    }

    async fn address_marks(&self, addr: &str) -> Result<Vec<AddressMark>> {
        Self::live(&self.addresses, &addr.to_lowercase())
    }

    async fn set_address_mark(&self, addr: &str, mark: AddressMark, ttl: Duration) -> Result<()> {
        self.insert(&self.addresses, &addr.to_lowercase(), mark, ttl).map(|_| ())
    }
}

// ── Redis store ─────────────────────────────────────────────────────

pub struct RedisMarkStore {
    client: redis::Client,
    connection: Arc<RwLock<Option<redis::aio::ConnectionManager>>>,
}

impl RedisMarkStore {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| anyhow!("Failed to create Redis client: {}", e))?;

        Ok(Self {
            client,
            connection: Arc::new(RwLock::new(None)),
        })
    }

    /// Get async connection (lazy initialization)
    async fn get_connection(&self) -> Result<redis::aio::ConnectionManager> {
        let mut conn_guard = self.connection.write().await;

        if let Some(conn) = conn_guard.as_ref() {
            return Ok(conn.clone());
        }
        let manager = self
            .client
            .get_connection_manager()
            .await
            .map_err(|e| anyhow!("Failed to get connection manager: {}", e))?;
        *conn_guard = Some(manager.clone());
        Ok(manager)
    }

    fn session_key(session_id: &str) -> String {
        format!("faucet:session:{}:marks", session_id)
    }

    fn address_key(addr: &str) -> String {
        format!("faucet:addr:{}:marks", addr.to_lowercase())
    }

    async fn members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.get_connection().await?;
        conn.smembers::<_, Vec<String>>(key)
            .await
            .map_err(|e| anyhow!("Failed to read marks {}: {}", key, e))
    }

    async fn add(&self, key: &str, member: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let added: i64 = conn
            .sadd::<_, _, i64>(key, member)
            .await
            .map_err(|e| anyhow!("Failed to set mark {}: {}", key, e))?;
        conn.expire::<_, ()>(key, ttl.as_secs().max(1) as i64)
            .await
            .map_err(|e| anyhow!("Failed to expire marks {}: {}", key, e))?;
        Ok(added > 0)
    }

    /// Health check
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow!("Redis PING failed: {}", e))?;

        if pong != "PONG" {
            return Err(anyhow!("Redis health check failed: got {}", pong));
        }
        Ok(())
    }
}

#[async_trait]
impl MarkStore for RedisMarkStore {
    async fn session_marks(&self, session_id: &str) -> Result<Vec<SessionMark>> {
        let raw = self.members(&Self::session_key(session_id)).await?;
        Ok(raw.iter().filter_map(|m| SessionMark::parse(m)).collect())
    }

    async fn set_session_mark(&self, session_id: &str, mark: SessionMark, ttl: Duration) -> Result<bool> {
        self.add(&Self::session_key(session_id), mark.as_str(), ttl).await
    }

    async fn remove_session_mark(&self, session_id: &str, mark: SessionMark) -> Result<()> {
        let key = Self::session_key(session_id);
        let mut conn = self.get_connection().await?;
        conn.srem::<_, _, ()>(&key, mark.as_str())
            .await
            .map_err(|e| anyhow!("Failed to remove mark {}: {}", key, e))
    }

    async fn address_marks(&self, addr: &str) -> Result<Vec<AddressMark>> {
        let raw = self.members(&Self::address_key(addr)).await?;
        Ok(raw.iter().filter_map(|m| AddressMark::parse(m)).collect())
    }

    async fn set_address_mark(&self, addr: &str, mark: AddressMark, ttl: Duration) -> Result<()> {
        self.add(&Self::address_key(addr), mark.as_str(), ttl).await.map(|_| ())
    }
}
