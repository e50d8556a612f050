/// Action handlers
///
/// One method per client action. Handlers never write to the socket
/// themselves; they return a [`Reply`] (or an error) and `dispatch` turns
/// it into exactly one outbound message.

use chrono::Utc;
use serde_json::{json, Value};
use std::time::Duration;
use uuid::Uuid;

use super::connection::Connection;
use super::FaucetServer;
use crate::error::{FaucetError, FaucetResult, LogLevel};
use crate::metrics::prometheus as metrics;
use crate::protocol::{
    ClaimRewardsRequest, ClientHandle, ClientMessage, FoundShareRequest, GetConfigRequest,
    ResumeSessionRequest, ServerMessage, StartSessionRequest, VerifyResultRequest, WatchClaimRequest,
};
use crate::session::{SessionOrigin, TokenError};
use crate::storage::{join_marks, AddressMark, SessionMark};

pub(super) enum Reply {
    /// `ok` carrying the payload
    Ok(Option<Value>),
    /// Reply under its own action name
    Named(&'static str, Value),
    /// Nothing to send now
    Silent,
}

/// Log a failed action at the error's level and report it to the client
pub(crate) fn send_error(client: &ClientHandle, action: &str, err: &FaucetError, rsp: Option<Value>) {
    match err.log_level() {
        LogLevel::Debug => tracing::debug!("conn {} {} failed: [{}] {}", client.conn_id, action, err.code(), err),
        LogLevel::Info => tracing::info!("conn {} {} failed: [{}] {}", client.conn_id, action, err.code(), err),
        LogLevel::Warn => tracing::warn!("conn {} {} failed: [{}] {}", client.conn_id, action, err.code(), err),
    }
    client.send(&ServerMessage::error(err, rsp));
}

/// `0x` followed by 40 hex digits, not the zero address
pub fn is_valid_address(addr: &str) -> bool {
    let Some(hex_part) = addr.strip_prefix("0x").or_else(|| addr.strip_prefix("0X")) else {
        return false;
    };
    hex_part.len() == 40
        && hex_part.chars().all(|c| c.is_ascii_hexdigit())
        && hex_part.chars().any(|c| c != '0')
}

fn format_duration(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    match (h, m) {
        (0, 0) => format!("{}s", s),
        (0, _) => format!("{}min {}s", m, s),
        _ => format!("{}h {}min", h, m),
    }
}

fn mark_store_error(err: anyhow::Error) -> FaucetError {
    tracing::error!("Mark store unavailable: {}", err);
    FaucetError::Internal("session state unavailable".to_string())
}

impl FaucetServer {
    pub(super) async fn dispatch(&self, conn: &mut Connection, message: ClientMessage) {
        let result = match message.action.as_str() {
            "ping" | "pong" => Ok(Reply::Silent),
            "getConfig" => Ok(self.on_get_config(conn, &message)),
            "startSession" => self.on_start_session(conn, &message).await,
            "resumeSession" => self.on_resume_session(conn, &message).await,
            "recoverSession" => self.on_recover_session(conn, &message).await,
            "foundShare" => self.on_found_share(conn, &message).await,
            "verifyResult" => self.on_verify_result(conn, &message).await,
            "closeSession" => self.on_close_session(conn).await,
            "claimRewards" => self.on_claim_rewards(&message).await,
            "getClaimQueueState" => Ok(Reply::Ok(Some(json!(self.claims.queue_state().await)))),
            "watchClaimTx" => self.on_watch_claim_tx(&message).await,
            _ => Err(FaucetError::InvalidAction),
        };

        let rsp = message.id;
        match result {
            Ok(Reply::Ok(data)) => {
                conn.client.send(&ServerMessage::ok(data, rsp));
            }
            Ok(Reply::Named(action, data)) => {
                conn.client.send(&ServerMessage::reply(action, Some(data), rsp));
            }
            Ok(Reply::Silent) => {}
            Err(err) => {
                if message.action == "foundShare" {
                    metrics::inc_shares_rejected(err.code());
                }
                send_error(&conn.client, &message.action, &err, rsp);
            }
        }
    }

    fn on_get_config(&self, conn: &mut Connection, message: &ClientMessage) -> Reply {
        if let Some(req) = message.payload::<GetConfigRequest>() {
            conn.client_version = req.version;
        }
        let cfg = &self.config;
        let params = &cfg.pow_scrypt_params;
        Reply::Named(
            "config",
            json!({
                "faucetTitle": cfg.faucet_title,
                "minClaim": cfg.claim_min_amount.to_string(),
                "maxClaim": cfg.claim_max_amount.to_string(),
                "powTimeout": cfg.pow_session_timeout,
                "claimTimeout": cfg.claim_session_timeout,
                "powParams": {
                    "n": params.cpu_and_memory,
                    "r": params.block_size,
                    "p": params.parallelization,
                    "l": params.key_length,
                    "d": params.difficulty,
                },
                "powNonceCount": cfg.pow_nonce_count,
                "powHashrateLimit": cfg.pow_hashrate_soft_limit,
                "shareReward": cfg.pow_share_reward.to_string(),
                "verifyReward": cfg.verify_reward().to_string(),
                "powPingInterval": cfg.pow_ping_interval,
                "powPingTimeout": cfg.pow_ping_timeout,
            }),
        )
    }

    async fn on_start_session(&self, conn: &Connection, message: &ClientMessage) -> FaucetResult<Reply> {
        if self.sessions.session_id_for_client(conn.conn_id).await.is_some() {
            return Err(FaucetError::duplicate_session());
        }
        let req: StartSessionRequest = message.payload().ok_or_else(FaucetError::invalid_request)?;
        if let Some(reason) = &self.config.deny_new_sessions {
            return Err(FaucetError::FaucetDisabled(reason.clone()));
        }

        let limit = self.config.concurrent_sessions;
        let ip = conn.remote_ip();
        if limit > 0 && self.sessions.count_by_ip(ip).await >= limit {
            return Err(FaucetError::ConcurrencyLimit(format!(
                "Only {} concurrent sessions allowed per IP",
                limit
            )));
        }

        let addr = req.addr.trim().to_lowercase();
        if !is_valid_address(&addr) {
            return Err(FaucetError::InvalidAddr(format!("Invalid target address: {}", req.addr)));
        }

        match self.sessions.marks().address_marks(&addr).await {
            Ok(marks) if marks.contains(&AddressMark::Used) => {
                return Err(FaucetError::InvalidAddr(format!(
                    "Cannot start session for {} (please wait {} between requests)",
                    addr,
                    format_duration(self.config.claim_addr_cooldown)
                )));
            }
            Ok(marks) if !marks.is_empty() => {
                return Err(FaucetError::InvalidAddr(format!(
                    "Cannot start session for {} ({})",
                    addr,
                    join_marks(&marks)
                )));
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("⚠️ Address mark lookup for {} failed: {}", addr, e),
        }

        if limit > 0 && self.sessions.count_by_addr(&addr).await >= limit {
            return Err(FaucetError::ConcurrencyLimit(format!(
                "Only {} concurrent sessions allowed per address",
                limit
            )));
        }

        if self.config.claim_addr_cooldown > 0 {
            let ttl = Duration::from_secs(self.config.claim_addr_cooldown);
            if let Err(e) = self.sessions.marks().set_address_mark(&addr, AddressMark::Used, ttl).await {
                tracing::warn!("⚠️ Could not mark address {}: {}", addr, e);
            }
        }

        let session = self
            .sessions
            .create_session(&conn.client, SessionOrigin::New { target_addr: addr }, Some(ip))
            .await?;
        Ok(Reply::Ok(Some(json!({
            "sessionId": session.id,
            "startTime": session.start_time,
            "preimage": session.preimage,
            "targetAddr": session.target_addr,
            "recovery": self.sessions.sign_token(&session),
        }))))
    }

    async fn on_resume_session(&self, conn: &Connection, message: &ClientMessage) -> FaucetResult<Reply> {
        if self.sessions.session_id_for_client(conn.conn_id).await.is_some() {
            return Err(FaucetError::duplicate_session());
        }
        let req: ResumeSessionRequest = message.payload().ok_or_else(FaucetError::invalid_request)?;
        if Uuid::parse_str(&req.session_id).is_err() {
            return Err(FaucetError::InvalidSessionId(format!("Invalid session id: {}", req.session_id)));
        }
        let last_nonce = self
            .sessions
            .resume_session(&conn.client, &req.session_id, Some(conn.remote_ip()))
            .await?;
        Ok(Reply::Ok(Some(json!({ "lastNonce": last_nonce }))))
    }

    async fn on_recover_session(&self, conn: &Connection, message: &ClientMessage) -> FaucetResult<Reply> {
        if self.sessions.session_id_for_client(conn.conn_id).await.is_some() {
            return Err(FaucetError::duplicate_session());
        }
        let token = message.data.as_ref().and_then(Value::as_str).ok_or_else(FaucetError::invalid_request)?;
        let info = self.sessions.signer().verify(token).map_err(|_| FaucetError::InvalidData)?;

        if self.sessions.session(&info.id).await.is_some() {
            return Err(FaucetError::DuplicateSession);
        }

        let limit = self.config.concurrent_sessions;
        let ip = conn.remote_ip();
        if limit > 0 && self.sessions.count_by_ip(ip).await >= limit {
            return Err(FaucetError::ConcurrencyLimit(format!(
                "Only {} concurrent sessions allowed per IP",
                limit
            )));
        }

        let timeout = self.config.claim_session_timeout;
        if timeout > 0 && info.age_secs(Utc::now().timestamp()) > timeout as i64 {
            return Err(FaucetError::SessionTimeout);
        }

        let marks = self.sessions.marks().session_marks(&info.id).await.map_err(mark_store_error)?;
        if !marks.is_empty() {
            return Err(FaucetError::InvalidSession(join_marks(&marks)));
        }

        self.sessions
            .create_session(&conn.client, SessionOrigin::Recovered(info), Some(ip))
            .await?;
        Ok(Reply::Ok(None))
    }

    async fn on_found_share(&self, conn: &Connection, message: &ClientMessage) -> FaucetResult<Reply> {
        if self.sessions.session_id_for_client(conn.conn_id).await.is_none() {
            return Err(FaucetError::SessionNotFound);
        }
        let share: FoundShareRequest =
            message.payload().ok_or_else(|| FaucetError::invalid_share("Invalid share data"))?;
        if share.params != self.config.pow_params_string() {
            return Err(FaucetError::invalid_share("Invalid share params"));
        }
        if share.nonces.len() != self.config.pow_nonce_count {
            return Err(FaucetError::invalid_share("Invalid nonce count"));
        }

        let snapshot = self.sessions.record_share(conn.conn_id, &share.nonces, share.hashrate).await?;

        // Verification may wait on peers; the connection keeps reading meanwhile
        let verifier = self.verifier.clone();
        let client = conn.client.clone();
        let rsp = message.id.clone();
        tokio::spawn(async move {
            let err = match verifier.start_verification(&snapshot, &share.nonces).await {
                Ok(result) if result.is_valid => {
                    client.send(&ServerMessage::ok(None, rsp));
                    return;
                }
                Ok(_) => FaucetError::WrongShare,
                Err(e) => e,
            };
            metrics::inc_shares_rejected(err.code());
            send_error(&client, "foundShare", &err, rsp);
        });
        Ok(Reply::Silent)
    }

    async fn on_verify_result(&self, conn: &Connection, message: &ClientMessage) -> FaucetResult<Reply> {
        let session_id = self
            .sessions
            .session_id_for_client(conn.conn_id)
            .await
            .ok_or(FaucetError::SessionNotFound)?;
        let req: VerifyResultRequest = message.payload().ok_or(FaucetError::InvalidVerifyResult)?;
        if self.verifier.process_verification_result(&req.share_id, &session_id, req.is_valid).await {
            self.verifier.reward_verifier(&session_id).await;
        }
        Ok(Reply::Silent)
    }

    async fn on_close_session(&self, conn: &Connection) -> FaucetResult<Reply> {
        let session = self.sessions.close_client_session(conn.conn_id).await?;
        let token = session.claimable.then(|| self.sessions.sign_token(&session));
        Ok(Reply::Ok(Some(json!({
            "claimable": session.claimable,
            "token": token,
        }))))
    }

    async fn on_claim_rewards(&self, message: &ClientMessage) -> FaucetResult<Reply> {
        let req = message
            .payload::<ClaimRewardsRequest>()
            .filter(|r| !r.token.is_empty())
            .ok_or_else(|| FaucetError::invalid_claim("Invalid claim token (missing)"))?;

        let now = Utc::now().timestamp();
        let info = match self.sessions.signer().verify_fresh(&req.token, self.config.claim_session_timeout, now) {
            Ok(info) => info,
            Err(TokenError::Expired) => return Err(FaucetError::invalid_claim("Invalid claim token (expired)")),
            Err(_) => return Err(FaucetError::invalid_claim("Invalid claim token (verification failed)")),
        };
        if !info.claimable {
            return Err(FaucetError::invalid_claim("Invalid claim token (not claimable)"));
        }

        let marks = self.sessions.marks();
        let blocking: Vec<SessionMark> = marks
            .session_marks(&info.id)
            .await
            .map_err(mark_store_error)?
            .into_iter()
            .filter(|m| *m != SessionMark::Closed)
            .collect();
        if !blocking.is_empty() {
            return Err(FaucetError::InvalidClaim(format!(
                "Session is not allowed to claim ({})",
                join_marks(&blocking)
            )));
        }
        // Setting CLAIMED is the atomic claim; only one caller can win it
        let won = marks
            .set_session_mark(&info.id, SessionMark::Claimed, self.config.session_mark_ttl())
            .await
            .map_err(mark_store_error)?;
        if !won {
            return Err(FaucetError::invalid_claim("Session is not allowed to claim (claimed)"));
        }
        let ticket = match self
            .claims
            .add_claim_transaction(&info.target_addr, info.balance, &info.id)
            .await
        {
            Ok(ticket) => ticket,
            Err(e) => {
                tracing::error!("❌ Could not queue claim for {}: {}", info.id, e);
                // hand the claim back so the token stays usable
                if let Err(e) = marks.remove_session_mark(&info.id, SessionMark::Claimed).await {
                    tracing::error!("❌ Could not release claim mark for {}: {}", info.id, e);
                }
                return Err(FaucetError::Internal("claim could not be queued".to_string()));
            }
        };
        self.sessions.mark_claimed(&info.id).await;
        Ok(Reply::Ok(Some(json!({ "queueIdx": ticket.queue_idx }))))
    }

    async fn on_watch_claim_tx(&self, message: &ClientMessage) -> FaucetResult<Reply> {
        let req: WatchClaimRequest = message.payload().ok_or_else(FaucetError::invalid_request)?;
        let ticket = self.claims.claim_status(&req.session_id).await.ok_or(FaucetError::ClaimNotFound)?;
        Ok(Reply::Ok(Some(json!(ticket))))
    }
}
