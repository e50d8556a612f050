use serde::Serialize;
use std::collections::VecDeque;
use std::net::IpAddr;

use super::recovery::RecoveryInfo;

/// Reported hashrate samples kept per session
pub const HASHRATE_WINDOW: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Mining,
    Idle,
    Closed,
    Claimed,
    Slashed,
}

impl SessionStatus {
    /// No balance or status change is allowed past these
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Slashed | SessionStatus::Claimed)
    }

    /// Still lives in the active index
    pub fn is_active(self) -> bool {
        matches!(self, SessionStatus::Mining | SessionStatus::Idle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlashReason {
    /// Submitted a share that failed verification
    InvalidShare,
    /// Reported a verify result contradicting the final verdict
    InvalidVerification,
}

impl SlashReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlashReason::InvalidShare => "invalid_share",
            SlashReason::InvalidVerification => "invalid_verification",
        }
    }

    /// Kill notice delivered to the client
    pub fn message(&self) -> &'static str {
        match self {
            SlashReason::InvalidShare => "You submitted an invalid share.",
            SlashReason::InvalidVerification => "You returned an invalid verification result.",
        }
    }
}

/// Server-side record of one miner's session
#[derive(Debug, Clone, Serialize)]
pub struct MinerSession {
    pub id: String,
    /// Unix seconds
    pub start_time: i64,
    /// Unix seconds since no connection is bound
    pub idle_time: Option<i64>,
    pub target_addr: String,
    /// Base64 puzzle input
    pub preimage: String,
    pub balance: u128,
    pub last_nonce: u64,
    pub reported_hashrate: VecDeque<f64>,
    pub status: SessionStatus,
    pub missed_verifications: u32,
    pub pending_verifications: u32,
    pub claimable: bool,
    pub close_reason: Option<String>,
    pub remote_ip: Option<IpAddr>,
}

impl MinerSession {
    pub fn new(id: String, target_addr: String, preimage: String, start_time: i64, remote_ip: Option<IpAddr>) -> Self {
        Self {
            id,
            start_time,
            idle_time: None,
            target_addr,
            preimage,
            balance: 0,
            last_nonce: 0,
            reported_hashrate: VecDeque::with_capacity(HASHRATE_WINDOW),
            status: SessionStatus::Mining,
            missed_verifications: 0,
            pending_verifications: 0,
            claimable: false,
            close_reason: None,
            remote_ip,
        }
    }

    /// Rebuild from a verified recovery token
    pub fn recovered(info: &RecoveryInfo, remote_ip: Option<IpAddr>) -> Self {
        let mut session = Self::new(
            info.id.clone(),
            info.target_addr.clone(),
            info.preimage.clone(),
            info.start_time,
            remote_ip,
        );
        session.balance = info.balance;
        session.last_nonce = info.nonce;
        session
    }

    pub fn recovery_info(&self) -> RecoveryInfo {
        RecoveryInfo {
            id: self.id.clone(),
            start_time: self.start_time,
            target_addr: self.target_addr.clone(),
            preimage: self.preimage.clone(),
            balance: self.balance,
            nonce: self.last_nonce,
            claimable: self.claimable,
        }
    }

    pub fn age_secs(&self, now: i64) -> u64 {
        now.saturating_sub(self.start_time).max(0) as u64
    }

    /// Push a self-reported rate, dropping the oldest beyond the window
    pub fn report_hashrate(&mut self, rate: f64) {
        if !rate.is_finite() || rate < 0.0 {
            return;
        }
        if self.reported_hashrate.len() >= HASHRATE_WINDOW {
            self.reported_hashrate.pop_front();
        }
        self.reported_hashrate.push_back(rate);
    }

    pub fn average_hashrate(&self) -> f64 {
        if self.reported_hashrate.is_empty() {
            return 0.0;
        }
        self.reported_hashrate.iter().sum::<f64>() / self.reported_hashrate.len() as f64
    }

    /// Credit `amount`; returns the new balance
    pub(crate) fn credit(&mut self, amount: u128) -> u128 {
        self.balance = self.balance.saturating_add(amount);
        self.balance
    }

    /// Debit up to `amount` without going below zero; returns what was actually taken
    pub(crate) fn debit(&mut self, amount: u128) -> u128 {
        let effective = amount.min(self.balance);
        self.balance -= effective;
        effective
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> MinerSession {
        MinerSession::new("id".into(), "0xabc".into(), "cHJl".into(), 1_000, None)
    }

    #[test]
    fn test_status_flags() {
        assert!(SessionStatus::Slashed.is_terminal());
        assert!(SessionStatus::Claimed.is_terminal());
        assert!(!SessionStatus::Closed.is_terminal());
        assert!(SessionStatus::Idle.is_active());
        assert!(!SessionStatus::Closed.is_active());
    }

    #[test]
    fn test_hashrate_window() {
        let mut s = session();
        for rate in [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0] {
            s.report_hashrate(rate);
        }
        assert_eq!(s.reported_hashrate.len(), HASHRATE_WINDOW);
        assert_eq!(s.reported_hashrate.front(), Some(&3.0));
        assert_eq!(s.average_hashrate(), 5.0);
        s.report_hashrate(f64::NAN);
        assert_eq!(s.reported_hashrate.len(), HASHRATE_WINDOW);
    }

    #[test]
    fn test_debit_clamps_at_zero() {
        let mut s = session();
        s.credit(30);
        assert_eq!(s.debit(50), 30);
        assert_eq!(s.balance, 0);
        assert_eq!(s.debit(5), 0);
    }

    #[test]
    fn test_recovery_info_roundtrip_fields() {
        let mut s = session();
        s.balance = 77;
        s.last_nonce = 12;
        let info = s.recovery_info();
        let r = MinerSession::recovered(&info, None);
        assert_eq!(r.id, s.id);
        assert_eq!(r.balance, 77);
        assert_eq!(r.last_nonce, 12);
        assert_eq!(r.start_time, 1_000);
        assert_eq!(r.status, SessionStatus::Mining);
    }
}
