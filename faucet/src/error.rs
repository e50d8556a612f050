/// Client-facing error taxonomy
///
/// Every failure that reaches a client is one of these variants. The wire
/// layer turns them into `{code, message, data}` objects; nothing here ever
/// closes a connection by itself.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
}

#[derive(Debug, Error)]
pub enum FaucetError {
    #[error("Unknown action")]
    InvalidAction,

    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    FaucetDisabled(String),

    #[error("{0}")]
    ConcurrencyLimit(String),

    #[error("{0}")]
    InvalidAddr(String),

    #[error("{0}")]
    InvalidSessionId(String),

    #[error("Session has been closed ({reason}).")]
    SessionClosed { reason: String, claim: Option<Value> },

    /// A recovered session id is already registered
    #[error("Session does already exist and cannot be recovered")]
    DuplicateSession,

    #[error("Invalid recovery data")]
    InvalidData,

    #[error("Session is too old to recover (timeout)")]
    SessionTimeout,

    #[error("Session cannot be recovered ({0})")]
    InvalidSession(String),

    #[error("No active session found")]
    SessionNotFound,

    #[error("{0}")]
    InvalidShare(String),

    #[error("Nonce too high (did you evade the hashrate limit?) {age}/{limit}")]
    HashrateLimit { age: u64, limit: u64 },

    #[error("Share verification failed")]
    WrongShare,

    #[error("Share verification error")]
    VerifyFailed,

    #[error("Invalid verification result data")]
    InvalidVerifyResult,

    #[error("{0}")]
    InvalidClaim(String),

    #[error("Claim transaction not found in queue")]
    ClaimNotFound,

    #[error("Client killed: {0}")]
    ClientKilled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FaucetError {
    pub fn code(&self) -> &'static str {
        match self {
            FaucetError::InvalidAction => "INVALID_ACTION",
            FaucetError::InvalidRequest(_) => "INVALID_REQUEST",
            FaucetError::FaucetDisabled(_) => "FAUCET_DISABLED",
            FaucetError::ConcurrencyLimit(_) => "CONCURRENCY_LIMIT",
            FaucetError::InvalidAddr(_) => "INVALID_ADDR",
            FaucetError::InvalidSessionId(_) => "INVALID_SESSIONID",
            FaucetError::SessionClosed { .. } => "SESSION_CLOSED",
            FaucetError::DuplicateSession => "DUPLICATE_SESSION",
            FaucetError::InvalidData => "INVALID_DATA",
            FaucetError::SessionTimeout => "SESSION_TIMEOUT",
            FaucetError::InvalidSession(_) => "INVALID_SESSION",
            FaucetError::SessionNotFound => "SESSION_NOT_FOUND",
            FaucetError::InvalidShare(_) => "INVALID_SHARE",
            FaucetError::HashrateLimit { .. } => "HASHRATE_LIMIT",
            FaucetError::WrongShare => "WRONG_SHARE",
            FaucetError::VerifyFailed => "VERIFY_FAILED",
            FaucetError::InvalidVerifyResult => "INVALID_VERIFYRESULT",
            FaucetError::InvalidClaim(_) => "INVALID_CLAIM",
            FaucetError::ClaimNotFound => "CLAIM_NOT_FOUND",
            FaucetError::ClientKilled(_) => "CLIENT_KILLED",
            FaucetError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Optional structured payload sent next to code and message
    pub fn data(&self) -> Option<Value> {
        match self {
            FaucetError::SessionClosed { claim, .. } => claim.clone(),
            _ => None,
        }
    }

    /// How loud a returned error should be in the server log
    pub fn log_level(&self) -> LogLevel {
        match self {
            FaucetError::FaucetDisabled(_)
            | FaucetError::ConcurrencyLimit(_)
            | FaucetError::InvalidAddr(_)
            | FaucetError::InvalidSessionId(_)
            | FaucetError::SessionClosed { .. } => LogLevel::Info,
            FaucetError::ClientKilled(_) => LogLevel::Debug,
            _ => LogLevel::Warn,
        }
    }

    pub fn invalid_share(message: &str) -> Self {
        FaucetError::InvalidShare(message.to_string())
    }

    pub fn invalid_claim(message: &str) -> Self {
        FaucetError::InvalidClaim(message.to_string())
    }

    /// The connection already owns a session (INVALID_REQUEST, not DUPLICATE_SESSION)
    pub fn duplicate_session() -> Self {
        FaucetError::InvalidRequest("Duplicate Session".to_string())
    }

    pub fn invalid_request() -> Self {
        FaucetError::InvalidRequest("Invalid request".to_string())
    }
}

pub type FaucetResult<T> = std::result::Result<T, FaucetError>;
