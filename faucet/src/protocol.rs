/// Faucet wire protocol
///
/// Newline-delimited JSON objects `{action, data?, id?}`. Replies echo the
/// request id as `rsp`; server pushes carry no `rsp`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::error::FaucetError;

/// Inbound client message
#[derive(Debug, Clone, Deserialize)]
pub struct ClientMessage {
    pub action: String,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub id: Option<Value>,
}

impl ClientMessage {
    /// Decode the payload into a typed request, `None` when absent or mistyped
    pub fn payload<T: for<'de> Deserialize<'de>>(&self) -> Option<T> {
        match &self.data {
            Some(v) if !v.is_null() => serde_json::from_value(v.clone()).ok(),
            _ => None,
        }
    }
}

/// Outbound message (reply or push)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerMessage {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsp: Option<Value>,
}

impl ServerMessage {
    pub fn push(action: &str, data: Value) -> Self {
        Self { action: action.to_string(), data: Some(data), rsp: None }
    }

    pub fn reply(action: &str, data: Option<Value>, rsp: Option<Value>) -> Self {
        Self { action: action.to_string(), data, rsp }
    }

    pub fn ok(data: Option<Value>, rsp: Option<Value>) -> Self {
        Self::reply("ok", data, rsp)
    }

    pub fn error(err: &FaucetError, rsp: Option<Value>) -> Self {
        let mut body = json!({
            "code": err.code(),
            "message": err.to_string(),
        });
        if let Some(data) = err.data() {
            body["data"] = data;
        }
        Self { action: "error".to_string(), data: Some(body), rsp }
    }

    /// Serialized line including the trailing newline
    pub fn to_line(&self) -> String {
        // Value-only content cannot fail to serialize
        serde_json::to_string(self).unwrap_or_default() + "\n"
    }
}

/// Non-owning send handle to one live connection
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub conn_id: u64,
    tx: mpsc::UnboundedSender<String>,
}

impl ClientHandle {
    pub fn new(conn_id: u64, tx: mpsc::UnboundedSender<String>) -> Self {
        Self { conn_id, tx }
    }

    /// Queue a message; a closed connection silently drops it
    pub fn send(&self, message: &ServerMessage) -> bool {
        self.tx.send(message.to_line()).is_ok()
    }
}

// ── Request payloads ────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct GetConfigRequest {
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartSessionRequest {
    pub addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResumeSessionRequest {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FoundShareRequest {
    pub nonces: Vec<u64>,
    pub params: String,
    #[serde(default)]
    pub hashrate: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyResultRequest {
    #[serde(rename = "shareId")]
    pub share_id: String,
    #[serde(rename = "isValid")]
    pub is_valid: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClaimRewardsRequest {
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchClaimRequest {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

// ── Push payloads ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct VerifyPush<'a> {
    #[serde(rename = "shareId")]
    pub share_id: &'a str,
    pub preimage: &'a str,
    pub nonces: &'a [u64],
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceUpdate<'a> {
    pub balance: String,
    pub recovery: String,
    pub reason: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionKill<'a> {
    pub level: &'a str,
    pub message: &'a str,
    pub token: Option<String>,
}

pub fn verify_push(share_id: &str, preimage: &str, nonces: &[u64]) -> ServerMessage {
    ServerMessage::push("verify", json!(VerifyPush { share_id, preimage, nonces }))
}

pub fn balance_update(balance: u128, recovery: String, reason: &str) -> ServerMessage {
    ServerMessage::push(
        "updateBalance",
        json!(BalanceUpdate { balance: balance.to_string(), recovery, reason }),
    )
}

pub fn session_kill(level: &str, message: &str, token: Option<String>) -> ServerMessage {
    ServerMessage::push("sessionKill", json!(SessionKill { level, message, token }))
}
