use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

use super::ClaimPipeline;
use crate::metrics::prometheus as metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    Queue,
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimTicket {
    pub queue_idx: u64,
    pub status: ClaimStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimQueueState {
    pub queue_length: usize,
    pub processed_idx: u64,
}

#[derive(Debug, Clone)]
struct ClaimTx {
    queue_idx: u64,
    session_id: String,
    target_addr: String,
    amount: u128,
    status: ClaimStatus,
}

#[derive(Default)]
struct QueueInner {
    pending: VecDeque<ClaimTx>,
    by_session: HashMap<String, u64>,
    next_idx: u64,
    processed_idx: u64,
    /// Queued or pending
    queued_amount: u128,
    paid_amount: u128,
}

/// In-memory FIFO of claim transactions waiting for a chain sender
pub struct ClaimQueue {
    wallet_balance: u128,
    inner: Mutex<QueueInner>,
}

impl ClaimQueue {
    pub fn new(wallet_balance: u128) -> Self {
        Self { wallet_balance, inner: Mutex::new(QueueInner { next_idx: 1, ..Default::default() }) }
    }

    /// Oldest queued claim as `(queue_idx, target, amount)`, moved to pending
    pub async fn take_next(&self) -> Option<(u64, String, u128)> {
        let mut inner = self.inner.lock().await;
        let tx = inner.pending.iter_mut().find(|tx| tx.status == ClaimStatus::Queue)?;
        tx.status = ClaimStatus::Pending;
        Some((tx.queue_idx, tx.target_addr.clone(), tx.amount))
    }

    /// Record the sender's outcome for a pending claim
    pub async fn finish(&self, queue_idx: u64, confirmed: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let pos = inner
            .pending
            .iter()
            .position(|tx| tx.queue_idx == queue_idx)
            .ok_or_else(|| anyhow!("claim #{} is not queued", queue_idx))?;
        let Some(mut tx) = inner.pending.remove(pos) else {
            return Err(anyhow!("claim #{} is not queued", queue_idx));
        };
        tx.status = if confirmed { ClaimStatus::Confirmed } else { ClaimStatus::Failed };
        inner.queued_amount = inner.queued_amount.saturating_sub(tx.amount);
        if confirmed {
            inner.paid_amount = inner.paid_amount.saturating_add(tx.amount);
        }
        inner.processed_idx = inner.processed_idx.max(tx.queue_idx);
        inner.by_session.remove(&tx.session_id);
        tracing::info!(
            "💸 Claim #{} for {} {}",
            tx.queue_idx,
            tx.session_id,
            if confirmed { "confirmed" } else { "failed" }
        );
        Ok(())
    }
}

#[async_trait]
impl ClaimPipeline for ClaimQueue {
    async fn add_claim_transaction(&self, target_addr: &str, amount: u128, session_id: &str) -> Result<ClaimTicket> {
        let mut inner = self.inner.lock().await;
        if inner.by_session.contains_key(session_id) {
            return Err(anyhow!("session {} already has a queued claim", session_id));
        }
        let queue_idx = inner.next_idx;
        inner.next_idx += 1;
        inner.queued_amount = inner.queued_amount.saturating_add(amount);
        inner.by_session.insert(session_id.to_string(), queue_idx);
        inner.pending.push_back(ClaimTx {
            queue_idx,
            session_id: session_id.to_string(),
            target_addr: target_addr.to_string(),
            amount,
            status: ClaimStatus::Queue,
        });
        metrics::inc_claims_queued();
        tracing::info!("💰 Queued claim #{} for {}: {} to {}", queue_idx, session_id, amount, target_addr);
        Ok(ClaimTicket { queue_idx, status: ClaimStatus::Queue })
    }

    async fn claim_status(&self, session_id: &str) -> Option<ClaimTicket> {
        let inner = self.inner.lock().await;
        let idx = *inner.by_session.get(session_id)?;
        inner
            .pending
            .iter()
            .find(|tx| tx.queue_idx == idx)
            .map(|tx| ClaimTicket { queue_idx: tx.queue_idx, status: tx.status })
    }

    async fn queue_state(&self) -> ClaimQueueState {
        let inner = self.inner.lock().await;
        ClaimQueueState { queue_length: inner.pending.len(), processed_idx: inner.processed_idx }
    }

    async fn faucet_balance(&self) -> u128 {
        let inner = self.inner.lock().await;
        self.wallet_balance
            .saturating_sub(inner.queued_amount)
            .saturating_sub(inner.paid_amount)
    }
}
