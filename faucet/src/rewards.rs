/// Reward limiter
///
/// Turns the configured base amounts into what a session is actually paid,
/// throttled by how much the faucet wallet still has left.

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{percent_of, FaucetConfig};
use crate::payout::ClaimPipeline;
use crate::session::MinerSession;

#[async_trait]
pub trait RewardLimiter: Send + Sync {
    async fn share_reward(&self, session: &MinerSession) -> u128;
    async fn verification_reward(&self, session: &MinerSession) -> u128;
}

pub struct StaticRewardLimiter {
    config: Arc<FaucetConfig>,
    claims: Arc<dyn ClaimPipeline>,
}

impl StaticRewardLimiter {
    pub fn new(config: Arc<FaucetConfig>, claims: Arc<dyn ClaimPipeline>) -> Self {
        Self { config, claims }
    }

    /// Lowest percent of every tier whose threshold the balance is at or below
    pub fn restriction_for(tiers: &[(u128, u32)], faucet_balance: u128) -> u32 {
        tiers
            .iter()
            .filter(|(threshold, _)| faucet_balance <= *threshold)
            .map(|(_, perc)| *perc)
            .fold(100, u32::min)
    }

    async fn restricted(&self, amount: u128) -> u128 {
        if self.config.balance_restriction_tiers.is_empty() {
            return amount;
        }
        let balance = self.claims.faucet_balance().await;
        let perc = Self::restriction_for(&self.config.balance_restriction_tiers, balance);
        if perc < 100 {
            tracing::debug!("Faucet balance {} restricts rewards to {}%", balance, perc);
            percent_of(amount, perc)
        } else {
            amount
        }
    }
}

#[async_trait]
impl RewardLimiter for StaticRewardLimiter {
    async fn share_reward(&self, _session: &MinerSession) -> u128 {
        self.restricted(self.config.pow_share_reward).await
    }

    async fn verification_reward(&self, _session: &MinerSession) -> u128 {
        self.restricted(self.config.verify_reward()).await
    }
}
