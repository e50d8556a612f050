pub mod claim_queue;

pub use claim_queue::{ClaimQueue, ClaimQueueState, ClaimStatus, ClaimTicket};

use anyhow::Result;
use async_trait::async_trait;

/// Hands claimed session balances over to whatever pays them out
#[async_trait]
pub trait ClaimPipeline: Send + Sync {
    /// Queue a payout; only called after the claim token was validated
    async fn add_claim_transaction(&self, target_addr: &str, amount: u128, session_id: &str) -> Result<ClaimTicket>;

    async fn claim_status(&self, session_id: &str) -> Option<ClaimTicket>;

    async fn queue_state(&self) -> ClaimQueueState;

    /// Spendable faucet funds not yet promised to queued claims
    async fn faucet_balance(&self) -> u128;
}
