/// Session registry
///
/// Owns every session: the active index, the closed index kept around for
/// late claims, and the two binding maps between sessions and live
/// connections. All balance and status changes go through here, each inside
/// a single write-lock section together with the timer retime it implies.

use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::recovery::{RecoveryInfo, TokenSigner};
use super::state::{MinerSession, SessionStatus, SlashReason};
use super::timers::{ClosedSession, SessionTimers, TimerHandle, TimerKind, TrackedSession};
use crate::config::FaucetConfig;
use crate::error::{FaucetError, FaucetResult};
use crate::metrics::prometheus as metrics;
use crate::protocol::{balance_update, session_kill, ClientHandle};
use crate::storage::{MarkStore, SessionMark};

/// Where a new session comes from
#[derive(Debug, Clone)]
pub enum SessionOrigin {
    New { target_addr: String },
    Recovered(RecoveryInfo),
}

#[derive(Default)]
struct Registry {
    active: HashMap<String, TrackedSession>,
    closed: HashMap<String, ClosedSession>,
    /// session id -> bound connection
    session_clients: HashMap<String, ClientHandle>,
    /// connection id -> session id
    client_sessions: HashMap<u64, String>,
}

impl Registry {
    fn bind(&mut self, session_id: &str, client: ClientHandle) {
        self.client_sessions.insert(client.conn_id, session_id.to_string());
        self.session_clients.insert(session_id.to_string(), client);
    }

    fn unbind(&mut self, session_id: &str) -> Option<ClientHandle> {
        let client = self.session_clients.remove(session_id)?;
        self.client_sessions.remove(&client.conn_id);
        Some(client)
    }

    fn count_by_ip(&self, ip: IpAddr, exclude: Option<&str>) -> usize {
        self.active
            .values()
            .filter(|e| e.session.remote_ip == Some(ip) && Some(e.session.id.as_str()) != exclude)
            .count()
    }
}

pub struct SessionManager {
    config: Arc<FaucetConfig>,
    marks: Arc<dyn MarkStore>,
    signer: TokenSigner,
    registry: RwLock<Registry>,
    timer_generation: AtomicU64,
    this: Weak<SessionManager>,
}

impl SessionManager {
    pub fn new(config: Arc<FaucetConfig>, marks: Arc<dyn MarkStore>) -> anyhow::Result<Arc<Self>> {
        let signer = TokenSigner::new(&config.faucet_secret)?;
        Ok(Arc::new_cyclic(|this| Self {
            config,
            marks,
            signer,
            registry: RwLock::new(Registry::default()),
            timer_generation: AtomicU64::new(0),
            this: this.clone(),
        }))
    }

    pub fn config(&self) -> &FaucetConfig {
        &self.config
    }

    pub fn marks(&self) -> &Arc<dyn MarkStore> {
        &self.marks
    }

    pub fn signer(&self) -> &TokenSigner {
        &self.signer
    }

    /// Signed recovery token reflecting the session's current fields
    pub fn sign_token(&self, session: &MinerSession) -> String {
        self.signer.sign(&session.recovery_info())
    }

    // ── Timers ──────────────────────────────────────────────────────

    fn schedule(&self, session_id: &str, kind: TimerKind, delay: Duration) -> TimerHandle {
        let generation = self.timer_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let manager = self.this.clone();
        let session_id = session_id.to_string();
        TimerHandle::schedule(delay, generation, async move {
            if let Some(manager) = manager.upgrade() {
                // Detached: the handling may drop this very timer
                tokio::spawn(async move {
                    manager.on_timer(session_id, kind, generation).await;
                });
            }
        })
    }

    /// Bring an active session's timers in line with its status
    fn retime(&self, entry: &mut TrackedSession) {
        let status = entry.session.status;
        if !status.is_active() {
            entry.timers.clear();
            return;
        }

        if entry.timers.session_timeout.is_none() && self.config.pow_session_timeout > 0 {
            let age = entry.session.age_secs(Utc::now().timestamp());
            let remaining = self.config.pow_session_timeout.saturating_sub(age);
            entry.timers.session_timeout = Some(self.schedule(
                &entry.session.id,
                TimerKind::SessionTimeout,
                Duration::from_secs(remaining),
            ));
        }

        match status {
            SessionStatus::Mining => entry.timers.idle_close = None,
            SessionStatus::Idle => {
                if entry.timers.idle_close.is_none() && self.config.pow_idle_timeout > 0 {
                    entry.timers.idle_close = Some(self.schedule(
                        &entry.session.id,
                        TimerKind::IdleClose,
                        Duration::from_secs(self.config.pow_idle_timeout),
                    ));
                }
            }
            _ => {}
        }
    }

    async fn on_timer(&self, session_id: String, kind: TimerKind, generation: u64) {
        if kind == TimerKind::Eviction {
            let mut reg = self.registry.write().await;
            let current = reg
                .closed
                .get(&session_id)
                .and_then(|c| c.eviction.as_ref())
                .map(|t| t.generation());
            if current == Some(generation) {
                reg.closed.remove(&session_id);
                tracing::debug!("🧹 Evicted closed session {}", session_id);
            }
            return;
        }

        let reason = match kind {
            TimerKind::IdleClose => "idle timeout",
            _ => "timeout",
        };
        let closed = {
            let mut guard = self.registry.write().await;
            let reg = &mut *guard;
            let current = reg.active.get_mut(&session_id).and_then(|e| {
                e.timers
                    .slot(kind)
                    .and_then(|slot| slot.as_ref().map(|t| t.generation()))
            });
            if current != Some(generation) {
                return;
            }
            self.close_locked(reg, &session_id, true, reason)
        };

        if let Some((session, client)) = closed {
            tracing::info!(
                "⏱️ Session {} closed by {} (balance {}, claimable {})",
                session.id,
                reason,
                session.balance,
                session.claimable
            );
            if let Some(client) = client {
                let token = session.claimable.then(|| self.sign_token(&session));
                client.send(&session_kill("timeout", "session timeout", token));
            }
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Create a new or recovered session bound to `client`
    pub async fn create_session(
        &self,
        client: &ClientHandle,
        origin: SessionOrigin,
        remote_ip: Option<IpAddr>,
    ) -> FaucetResult<MinerSession> {
        let now = Utc::now().timestamp();
        let mut guard = self.registry.write().await;
        let reg = &mut *guard;

        if reg.client_sessions.contains_key(&client.conn_id) {
            return Err(FaucetError::duplicate_session());
        }

        let (session, recovered) = match origin {
            SessionOrigin::New { target_addr } => {
                let preimage: [u8; 8] = rand::random();
                (
                    MinerSession::new(
                        Uuid::new_v4().to_string(),
                        target_addr,
                        STANDARD.encode(preimage),
                        now,
                        remote_ip,
                    ),
                    false,
                )
            }
            SessionOrigin::Recovered(info) => {
                if reg.active.contains_key(&info.id) || reg.closed.contains_key(&info.id) {
                    return Err(FaucetError::DuplicateSession);
                }
                (MinerSession::recovered(&info, remote_ip), true)
            }
        };

        let id = session.id.clone();
        let mut entry = TrackedSession { session, timers: SessionTimers::default() };
        self.retime(&mut entry);
        let snapshot = entry.session.clone();
        reg.active.insert(id.clone(), entry);
        reg.bind(&id, client.clone());
        metrics::set_active_sessions(reg.active.len());
        drop(guard);

        metrics::inc_sessions_created();
        tracing::info!(
            "⛏️ {} session {} for {} (balance {})",
            if recovered { "Recovered" } else { "Created" },
            id,
            snapshot.target_addr,
            snapshot.balance
        );
        Ok(snapshot)
    }

    /// Reattach `client` to an active session, kicking any previous connection
    pub async fn resume_session(
        &self,
        client: &ClientHandle,
        session_id: &str,
        remote_ip: Option<IpAddr>,
    ) -> FaucetResult<u64> {
        let mut guard = self.registry.write().await;
        let reg = &mut *guard;

        if reg.client_sessions.contains_key(&client.conn_id) {
            return Err(FaucetError::duplicate_session());
        }
        if !reg.active.contains_key(session_id) {
            if let Some(closed) = reg.closed.get(session_id) {
                let s = &closed.session;
                let claim = (s.claimable && s.status == SessionStatus::Closed).then(|| {
                    json!({
                        "balance": s.balance.to_string(),
                        "token": self.sign_token(s),
                    })
                });
                return Err(FaucetError::SessionClosed {
                    reason: s.close_reason.clone().unwrap_or_else(|| "closed".to_string()),
                    claim,
                });
            }
            return Err(FaucetError::InvalidSessionId(format!("Unknown session id: {}", session_id)));
        }

        let limit = self.config.concurrent_sessions;
        if let Some(ip) = remote_ip {
            if limit > 0 && reg.count_by_ip(ip, Some(session_id)) >= limit {
                return Err(FaucetError::ConcurrencyLimit("Concurrent session limit reached".to_string()));
            }
        }

        if let Some(previous) = reg.unbind(session_id) {
            previous.send(&session_kill("client", "session resumed from another client", None));
        }
        reg.bind(session_id, client.clone());

        let Some(entry) = reg.active.get_mut(session_id) else {
            return Err(FaucetError::SessionNotFound);
        };
        entry.session.status = SessionStatus::Mining;
        entry.session.idle_time = None;
        if remote_ip.is_some() {
            entry.session.remote_ip = remote_ip;
        }
        self.retime(entry);
        tracing::info!("🔁 Session {} resumed by connection {}", session_id, client.conn_id);
        Ok(entry.session.last_nonce)
    }

    /// Connection went away; its session (if any) turns idle
    pub async fn disconnect(&self, conn_id: u64) {
        let mut guard = self.registry.write().await;
        let reg = &mut *guard;

        let Some(session_id) = reg.client_sessions.remove(&conn_id) else {
            return;
        };
        if reg.session_clients.get(&session_id).map(|c| c.conn_id) == Some(conn_id) {
            reg.session_clients.remove(&session_id);
        }
        if let Some(entry) = reg.active.get_mut(&session_id) {
            entry.session.status = SessionStatus::Idle;
            entry.session.idle_time = Some(Utc::now().timestamp());
            self.retime(entry);
            tracing::debug!("💤 Session {} is idle", session_id);
        }
    }

    fn close_locked(
        &self,
        reg: &mut Registry,
        session_id: &str,
        make_claimable: bool,
        reason: &str,
    ) -> Option<(MinerSession, Option<ClientHandle>)> {
        let mut entry = reg.active.remove(session_id)?;
        let client = reg.unbind(session_id);
        entry.timers.clear();

        let session = &mut entry.session;
        if make_claimable && session.balance >= self.config.claim_min_amount {
            session.claimable = true;
            if session.balance > self.config.claim_max_amount {
                session.balance = self.config.claim_max_amount;
            }
        }
        session.status = SessionStatus::Closed;
        session.idle_time = None;
        session.close_reason = Some(reason.to_string());
        let snapshot = session.clone();

        let eviction = self.schedule(session_id, TimerKind::Eviction, self.config.closed_session_lifetime());
        reg.closed.insert(
            session_id.to_string(),
            ClosedSession { session: entry.session, eviction: Some(eviction) },
        );
        metrics::set_active_sessions(reg.active.len());
        metrics::inc_sessions_closed();
        Some((snapshot, client))
    }

    /// Close an active session, optionally persisting a CLOSED mark
    pub async fn close_session(
        &self,
        session_id: &str,
        persist: bool,
        make_claimable: bool,
        reason: &str,
    ) -> FaucetResult<MinerSession> {
        let closed = {
            let mut guard = self.registry.write().await;
            self.close_locked(&mut guard, session_id, make_claimable, reason)
        };
        let (session, _client) = closed.ok_or(FaucetError::SessionNotFound)?;

        if persist {
            if let Err(e) = self
                .marks
                .set_session_mark(session_id, SessionMark::Closed, self.config.session_mark_ttl())
                .await
            {
                tracing::warn!("⚠️ Failed to persist close mark for {}: {}", session_id, e);
            }
        }
        tracing::info!(
            "🔒 Session {} closed ({}), balance {}, claimable {}",
            session_id,
            reason,
            session.balance,
            session.claimable
        );
        Ok(session)
    }

    /// Close whatever session `conn_id` is bound to
    pub async fn close_client_session(&self, conn_id: u64) -> FaucetResult<MinerSession> {
        let session_id = self
            .session_id_for_client(conn_id)
            .await
            .ok_or(FaucetError::SessionNotFound)?;
        self.close_session(&session_id, true, true, "closed").await
    }

    /// Kill a session for cheating. Returns false when already terminal or unknown.
    pub async fn slash(&self, session_id: &str, reason: SlashReason) -> bool {
        let client = {
            let mut guard = self.registry.write().await;
            let reg = &mut *guard;

            if let Some(mut entry) = reg.active.remove(session_id) {
                let client = reg.unbind(session_id);
                entry.timers.clear();
                entry.session.status = SessionStatus::Slashed;
                entry.session.claimable = false;
                entry.session.idle_time = None;
                entry.session.close_reason = Some(reason.as_str().to_string());
                let eviction =
                    self.schedule(session_id, TimerKind::Eviction, self.config.closed_session_lifetime());
                reg.closed.insert(
                    session_id.to_string(),
                    ClosedSession { session: entry.session, eviction: Some(eviction) },
                );
                metrics::set_active_sessions(reg.active.len());
                client
            } else if let Some(closed) = reg.closed.get_mut(session_id) {
                if closed.session.status.is_terminal() {
                    return false;
                }
                closed.session.status = SessionStatus::Slashed;
                closed.session.claimable = false;
                closed.session.close_reason = Some(reason.as_str().to_string());
                None
            } else {
                return false;
            }
        };

        if let Some(client) = client {
            client.send(&session_kill("session", reason.message(), None));
        }
        if let Err(e) = self
            .marks
            .set_session_mark(session_id, SessionMark::Killed, self.config.session_mark_ttl())
            .await
        {
            tracing::warn!("⚠️ Failed to persist kill mark for {}: {}", session_id, e);
        }
        metrics::inc_sessions_slashed(reason.as_str());
        tracing::warn!("⚔️ Slashed session {} ({})", session_id, reason.as_str());
        true
    }

    /// Closed session was paid out
    pub async fn mark_claimed(&self, session_id: &str) -> bool {
        let mut reg = self.registry.write().await;
        match reg.closed.get_mut(session_id) {
            Some(closed) if closed.session.status == SessionStatus::Closed => {
                closed.session.status = SessionStatus::Claimed;
                true
            }
            _ => false,
        }
    }

    // ── Accounting ──────────────────────────────────────────────────

    /// Credit an active session and push the new balance. Returns the new balance.
    pub async fn add_reward(&self, session_id: &str, amount: u128, reason: &str) -> Option<u128> {
        let mut guard = self.registry.write().await;
        let reg = &mut *guard;

        let entry = reg.active.get_mut(session_id)?;
        let balance = entry.session.credit(amount);
        if let Some(client) = reg.session_clients.get(session_id) {
            client.send(&balance_update(balance, self.sign_token(&entry.session), reason));
        }
        Some(balance)
    }

    /// Debit an active session (floored at zero) and push the new balance.
    /// Returns the penalty actually applied.
    pub async fn add_penalty(&self, session_id: &str, amount: u128, reason: &str) -> Option<u128> {
        let mut guard = self.registry.write().await;
        let reg = &mut *guard;

        let entry = reg.active.get_mut(session_id)?;
        let effective = entry.session.debit(amount);
        if let Some(client) = reg.session_clients.get(session_id) {
            let reason = format!("{} (penalty: {})", reason, effective);
            client.send(&balance_update(entry.session.balance, self.sign_token(&entry.session), &reason));
        }
        Some(effective)
    }

    /// Accept the nonces of a share for the session bound to `conn_id`.
    /// Nothing is mutated unless every check passes.
    pub async fn record_share(
        &self,
        conn_id: u64,
        nonces: &[u64],
        hashrate: Option<f64>,
    ) -> FaucetResult<MinerSession> {
        let now = Utc::now().timestamp();
        let mut guard = self.registry.write().await;
        let reg = &mut *guard;

        let session_id = reg.client_sessions.get(&conn_id).ok_or(FaucetError::SessionNotFound)?;
        let entry = reg.active.get_mut(session_id).ok_or(FaucetError::SessionNotFound)?;
        let session = &mut entry.session;

        let mut last_nonce = session.last_nonce;
        for &nonce in nonces {
            if nonce <= last_nonce {
                return Err(FaucetError::invalid_share("Nonce too low"));
            }
            last_nonce = nonce;
        }

        let hard_limit = self.config.pow_hashrate_hard_limit;
        if hard_limit > 0 {
            let age = session.age_secs(now);
            let limit = (age + 30).saturating_mul(hard_limit);
            if last_nonce > limit {
                return Err(FaucetError::HashrateLimit { age, limit });
            }
        }

        session.last_nonce = last_nonce;
        if let Some(rate) = hashrate {
            session.report_hashrate(rate);
        }
        session.missed_verifications = 0;
        Ok(session.clone())
    }

    // ── Verifier bookkeeping ────────────────────────────────────────

    /// Sessions that may be asked to verify someone else's share
    pub async fn verifier_pool(&self, exclude: &str) -> Vec<String> {
        let min_balance = self.config.miss_penalty();
        let reg = self.registry.read().await;
        reg.session_clients
            .keys()
            .filter(|id| id.as_str() != exclude)
            .filter(|id| {
                reg.active.get(id.as_str()).map_or(false, |e| {
                    e.session.balance >= min_balance
                        && e.session.missed_verifications < self.config.verify_miner_max_missed
                        && e.session.pending_verifications < self.config.verify_miner_max_pending
                })
            })
            .cloned()
            .collect()
    }

    /// Count a verify request against each peer; returns those still reachable
    pub async fn assign_verifiers(&self, session_ids: &[String]) -> Vec<(String, ClientHandle)> {
        let mut guard = self.registry.write().await;
        let reg = &mut *guard;

        let mut assigned = Vec::with_capacity(session_ids.len());
        for id in session_ids {
            let (Some(entry), Some(client)) = (reg.active.get_mut(id), reg.session_clients.get(id)) else {
                continue;
            };
            entry.session.pending_verifications += 1;
            assigned.push((id.clone(), client.clone()));
        }
        assigned
    }

    /// Peer answered (or failed to answer) a verify request
    pub async fn finish_verification(&self, session_id: &str, missed: bool) {
        let mut reg = self.registry.write().await;
        if let Some(entry) = reg.active.get_mut(session_id) {
            entry.session.pending_verifications = entry.session.pending_verifications.saturating_sub(1);
            if missed {
                entry.session.missed_verifications += 1;
            }
        }
    }

    // ── Lookups ─────────────────────────────────────────────────────

    pub async fn session(&self, session_id: &str) -> Option<MinerSession> {
        let reg = self.registry.read().await;
        reg.active.get(session_id).map(|e| e.session.clone())
    }

    pub async fn closed_session(&self, session_id: &str) -> Option<MinerSession> {
        let reg = self.registry.read().await;
        reg.closed.get(session_id).map(|c| c.session.clone())
    }

    /// Active or closed
    pub async fn find_session(&self, session_id: &str) -> Option<MinerSession> {
        let reg = self.registry.read().await;
        reg.active
            .get(session_id)
            .map(|e| e.session.clone())
            .or_else(|| reg.closed.get(session_id).map(|c| c.session.clone()))
    }

    pub async fn session_id_for_client(&self, conn_id: u64) -> Option<String> {
        self.registry.read().await.client_sessions.get(&conn_id).cloned()
    }

    pub async fn client_for_session(&self, session_id: &str) -> Option<ClientHandle> {
        self.registry.read().await.session_clients.get(session_id).cloned()
    }

    pub async fn count_by_ip(&self, ip: IpAddr) -> usize {
        self.registry.read().await.count_by_ip(ip, None)
    }

    pub async fn count_by_addr(&self, target_addr: &str) -> usize {
        let reg = self.registry.read().await;
        reg.active
            .values()
            .filter(|e| e.session.target_addr.eq_ignore_ascii_case(target_addr))
            .count()
    }

    pub async fn active_count(&self) -> usize {
        self.registry.read().await.active.len()
    }

    pub async fn closed_count(&self) -> usize {
        self.registry.read().await.closed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ServerMessage;
    use crate::storage::MemoryMarkStore;
    use tokio::sync::mpsc;

    const ADDR: &str = "0x1111111111111111111111111111111111111111";

    fn config() -> FaucetConfig {
        let mut cfg = FaucetConfig::default();
        cfg.faucet_secret = "test-secret".into();
        cfg.pow_share_reward = 1000;
        cfg.claim_min_amount = 100;
        cfg.claim_max_amount = 5000;
        cfg.pow_session_timeout = 600;
        cfg.pow_idle_timeout = 60;
        cfg.claim_session_timeout = 3600;
        cfg.normalize();
        cfg
    }

    fn manager_with(cfg: FaucetConfig) -> (Arc<SessionManager>, Arc<MemoryMarkStore>) {
        let marks = Arc::new(MemoryMarkStore::new());
        let manager = SessionManager::new(Arc::new(cfg), marks.clone()).unwrap();
        (manager, marks)
    }

    fn client(conn_id: u64) -> (ClientHandle, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientHandle::new(conn_id, tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(line) = rx.try_recv() {
            out.push(serde_json::from_str(line.trim()).unwrap());
        }
        out
    }

    async fn start(manager: &SessionManager, conn: &ClientHandle) -> MinerSession {
        manager
            .create_session(conn, SessionOrigin::New { target_addr: ADDR.into() }, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_binds_connection() {
        let (manager, _) = manager_with(config());
        let (conn, _rx) = client(1);
        let session = start(&manager, &conn).await;

        assert_eq!(session.status, SessionStatus::Mining);
        assert!(!session.preimage.is_empty());
        assert_eq!(manager.session_id_for_client(1).await, Some(session.id.clone()));
        assert_eq!(manager.client_for_session(&session.id).await.unwrap().conn_id, 1);

        let err = manager
            .create_session(&conn, SessionOrigin::New { target_addr: ADDR.into() }, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn test_resume_kicks_previous_connection() {
        let (manager, _) = manager_with(config());
        let (first, mut first_rx) = client(1);
        let (second, _second_rx) = client(2);
        let session = start(&manager, &first).await;

        let last_nonce = manager.resume_session(&second, &session.id, None).await.unwrap();
        assert_eq!(last_nonce, 0);

        let kills = drain(&mut first_rx);
        assert_eq!(kills.len(), 1);
        assert_eq!(kills[0].action, "sessionKill");
        assert_eq!(kills[0].data.as_ref().unwrap()["level"], "client");

        assert_eq!(manager.session_id_for_client(1).await, None);
        assert_eq!(manager.client_for_session(&session.id).await.unwrap().conn_id, 2);

        // the evicted connection going away must not unbind the new one
        manager.disconnect(1).await;
        assert_eq!(manager.session(&session.id).await.unwrap().status, SessionStatus::Mining);
    }

    #[tokio::test]
    async fn test_resume_unknown_and_closed() {
        let (manager, _) = manager_with(config());
        let (conn, _rx) = client(1);
        let err = manager.resume_session(&conn, "5b8e1f0a-0000-4000-8000-000000000000", None).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_SESSIONID");

        let (owner, _owner_rx) = client(2);
        let session = start(&manager, &owner).await;
        manager.add_reward(&session.id, 500, "share").await;
        manager.close_session(&session.id, true, true, "closed").await.unwrap();

        let err = manager.resume_session(&conn, &session.id, None).await.unwrap_err();
        assert_eq!(err.code(), "SESSION_CLOSED");
        assert!(err.to_string().contains("closed"));
        let claim = err.data().unwrap();
        assert_eq!(claim["balance"], "500");
        assert!(manager.signer().verify(claim["token"].as_str().unwrap()).unwrap().claimable);
        assert_eq!(manager.session_id_for_client(1).await, None);
    }

    #[tokio::test]
    async fn test_nonce_must_increase() {
        let (manager, _) = manager_with(config());
        let (conn, _rx) = client(1);
        let session = start(&manager, &conn).await;

        let s = manager.record_share(1, &[200], Some(10.0)).await.unwrap();
        assert_eq!(s.last_nonce, 200);

        let err = manager.record_share(1, &[156], None).await.unwrap_err();
        assert_eq!(err.to_string(), "Nonce too low");
        let err = manager.record_share(1, &[201, 200], None).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_SHARE");

        let s = manager.session(&session.id).await.unwrap();
        assert_eq!(s.last_nonce, 200);
        assert_eq!(s.balance, 0);
    }

    #[tokio::test]
    async fn test_hashrate_hard_limit_rejects_without_mutation() {
        let mut cfg = config();
        cfg.pow_hashrate_hard_limit = 10;
        let (manager, _) = manager_with(cfg);
        let (conn, _rx) = client(1);
        let session = start(&manager, &conn).await;

        // fresh session: limit is (0 + 30) * 10
        let err = manager.record_share(1, &[301], None).await.unwrap_err();
        assert_eq!(err.code(), "HASHRATE_LIMIT");
        assert_eq!(manager.session(&session.id).await.unwrap().last_nonce, 0);
        assert!(manager.record_share(1, &[300], None).await.is_ok());
    }

    #[tokio::test]
    async fn test_penalty_clamped_and_pushed() {
        let (manager, _) = manager_with(config());
        let (conn, mut rx) = client(1);
        let session = start(&manager, &conn).await;

        assert_eq!(manager.add_reward(&session.id, 40, "share").await, Some(40));
        assert_eq!(manager.add_penalty(&session.id, 100, "verify miss").await, Some(40));
        assert_eq!(manager.session(&session.id).await.unwrap().balance, 0);

        let pushes = drain(&mut rx);
        assert_eq!(pushes.len(), 2);
        let last = pushes[1].data.as_ref().unwrap();
        assert_eq!(last["balance"], "0");
        assert_eq!(last["reason"], "verify miss (penalty: 40)");
        let info = manager.signer().verify(last["recovery"].as_str().unwrap()).unwrap();
        assert_eq!(info.balance, 0);
    }

    #[tokio::test]
    async fn test_claimable_threshold_and_clamp() {
        let (manager, _) = manager_with(config());

        let (a, _ra) = client(1);
        let low = start(&manager, &a).await;
        manager.add_reward(&low.id, 99, "share").await;
        let closed = manager.close_session(&low.id, false, true, "closed").await.unwrap();
        assert!(!closed.claimable);
        assert_eq!(closed.balance, 99);

        let (b, _rb) = client(2);
        let high = start(&manager, &b).await;
        manager.add_reward(&high.id, 9000, "share").await;
        let closed = manager.close_session(&high.id, false, true, "closed").await.unwrap();
        assert!(closed.claimable);
        assert_eq!(closed.balance, 5000);
        assert_eq!(manager.closed_session(&high.id).await.unwrap().balance, 5000);
    }

    #[tokio::test]
    async fn test_slash_is_terminal() {
        let (manager, marks) = manager_with(config());
        let (conn, mut rx) = client(1);
        let session = start(&manager, &conn).await;
        manager.add_reward(&session.id, 700, "share").await;

        assert!(manager.slash(&session.id, SlashReason::InvalidShare).await);
        assert!(!manager.slash(&session.id, SlashReason::InvalidVerification).await);

        let s = manager.find_session(&session.id).await.unwrap();
        assert_eq!(s.status, SessionStatus::Slashed);
        assert!(!s.claimable);
        assert_eq!(manager.add_reward(&session.id, 10, "share").await, None);
        assert_eq!(manager.add_penalty(&session.id, 10, "miss").await, None);
        assert!(manager.close_session(&session.id, true, true, "closed").await.is_err());
        assert!(!manager.mark_claimed(&session.id).await);
        assert_eq!(manager.find_session(&session.id).await.unwrap().balance, 700);

        assert_eq!(marks.session_marks(&session.id).await.unwrap(), vec![SessionMark::Killed]);
        let pushes = drain(&mut rx);
        let kill = pushes.iter().find(|m| m.action == "sessionKill").unwrap();
        assert_eq!(kill.data.as_ref().unwrap()["level"], "session");
        assert_eq!(manager.session_id_for_client(1).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timer_closes_and_rebind_cancels() {
        let (manager, _) = manager_with(config());
        let (conn, _rx) = client(1);
        let session = start(&manager, &conn).await;

        manager.disconnect(1).await;
        let s = manager.session(&session.id).await.unwrap();
        assert_eq!(s.status, SessionStatus::Idle);
        assert!(s.idle_time.is_some());

        // rebinding before the idle timeout disarms it
        tokio::time::sleep(Duration::from_secs(30)).await;
        let (again, _rx2) = client(2);
        manager.resume_session(&again, &session.id, None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(manager.session(&session.id).await.unwrap().status, SessionStatus::Mining);

        manager.disconnect(2).await;
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(manager.session(&session.id).await.is_none());
        let closed = manager.closed_session(&session.id).await.unwrap();
        assert_eq!(closed.status, SessionStatus::Closed);
        assert_eq!(closed.close_reason.as_deref(), Some("idle timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_timeout_notifies_with_token() {
        let (manager, _) = manager_with(config());
        let (conn, mut rx) = client(1);
        let session = start(&manager, &conn).await;
        manager.add_reward(&session.id, 250, "share").await;

        tokio::time::sleep(Duration::from_secs(601)).await;
        let closed = manager.closed_session(&session.id).await.unwrap();
        assert_eq!(closed.status, SessionStatus::Closed);
        assert!(closed.claimable);

        let pushes = drain(&mut rx);
        let kill = pushes.iter().find(|m| m.action == "sessionKill").unwrap();
        let data = kill.data.as_ref().unwrap();
        assert_eq!(data["level"], "timeout");
        let info = manager.signer().verify(data["token"].as_str().unwrap()).unwrap();
        assert!(info.claimable);
        assert_eq!(info.balance, 250);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_index_evicts() {
        let (manager, _) = manager_with(config());
        let (conn, _rx) = client(1);
        let session = start(&manager, &conn).await;
        manager.close_session(&session.id, false, false, "closed").await.unwrap();
        assert_eq!(manager.closed_count().await, 1);

        // claim timeout 3600 + margin 60
        tokio::time::sleep(Duration::from_secs(3659)).await;
        assert_eq!(manager.closed_count().await, 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(manager.closed_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slashed_idle_session_not_closed_by_stale_timer() {
        let (manager, _) = manager_with(config());
        let (conn, _rx) = client(1);
        let session = start(&manager, &conn).await;
        manager.disconnect(1).await;
        manager.slash(&session.id, SlashReason::InvalidShare).await;

        tokio::time::sleep(Duration::from_secs(120)).await;
        let s = manager.find_session(&session.id).await.unwrap();
        assert_eq!(s.status, SessionStatus::Slashed);
        assert_eq!(s.close_reason.as_deref(), Some("invalid_share"));
    }

    #[tokio::test]
    async fn test_recovered_session_keeps_fields() {
        let (manager, _) = manager_with(config());
        let info = RecoveryInfo {
            id: Uuid::new_v4().to_string(),
            start_time: Utc::now().timestamp() - 100,
            target_addr: ADDR.into(),
            preimage: "AAECAwQFBgc=".into(),
            balance: 4242,
            nonce: 77,
            claimable: false,
        };
        let (conn, _rx) = client(1);
        let s = manager
            .create_session(&conn, SessionOrigin::Recovered(info.clone()), None)
            .await
            .unwrap();
        assert_eq!(s.recovery_info(), info);

        let (other, _rx2) = client(2);
        let err = manager
            .create_session(&other, SessionOrigin::Recovered(info), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_SESSION");
    }

    #[tokio::test]
    async fn test_verifier_pool_filters() {
        let mut cfg = config();
        cfg.verify_miner_miss_penalty_perc = 10; // min balance 100
        cfg.verify_miner_max_pending = 1;
        cfg.verify_miner_max_missed = 2;
        let (manager, _) = manager_with(cfg);

        let (a, _ra) = client(1);
        let (b, _rb) = client(2);
        let (c, _rc) = client(3);
        let submitter = start(&manager, &a).await;
        let rich = start(&manager, &b).await;
        let poor = start(&manager, &c).await;
        manager.add_reward(&submitter.id, 1000, "share").await;
        manager.add_reward(&rich.id, 1000, "share").await;
        manager.add_reward(&poor.id, 99, "share").await;

        assert_eq!(manager.verifier_pool(&submitter.id).await, vec![rich.id.clone()]);

        let assigned = manager.assign_verifiers(&[rich.id.clone()]).await;
        assert_eq!(assigned.len(), 1);
        // pending cap reached
        assert!(manager.verifier_pool(&submitter.id).await.is_empty());

        manager.finish_verification(&rich.id, true).await;
        manager.assign_verifiers(&[rich.id.clone()]).await;
        manager.finish_verification(&rich.id, true).await;
        let s = manager.session(&rich.id).await.unwrap();
        assert_eq!(s.missed_verifications, 2);
        assert_eq!(s.pending_verifications, 0);
        // missed cap reached
        assert!(manager.verifier_pool(&submitter.id).await.is_empty());

        // unbound sessions never verify
        manager.record_share(2, &[1], None).await.unwrap();
        manager.disconnect(2).await;
        assert!(manager.verifier_pool(&submitter.id).await.is_empty());
    }
}
