use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Scrypt work parameters handed to miners and to the validator
#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ScryptParams {
    /// Work factor N (power of two)
    #[serde(alias = "cpuAndMemory")]
    pub cpu_and_memory: u32,
    #[serde(alias = "blockSize")]
    pub block_size: u32,
    /// Older configs carry the misspelled key
    #[serde(alias = "paralellization")]
    pub parallelization: u32,
    #[serde(alias = "keyLength")]
    pub key_length: u32,
    /// Required leading zero bits of the hash
    pub difficulty: u32,
}

impl Default for ScryptParams {
    fn default() -> Self {
        Self {
            cpu_and_memory: 4096,
            block_size: 8,
            parallelization: 1,
            key_length: 16,
            difficulty: 9,
        }
    }
}

impl ScryptParams {
    /// Ordered parameter string shares must echo back exactly
    pub fn match_string(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.cpu_and_memory, self.block_size, self.parallelization, self.key_length, self.difficulty
        )
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct FaucetConfig {
    pub listen: String,
    #[serde(alias = "apiListen")]
    pub api_listen: String,
    #[serde(alias = "redisUrl")]
    pub redis_url: Option<String>,
    #[serde(alias = "maxConnections")]
    pub max_connections: usize,
    #[serde(alias = "maxConnectionsPerIp")]
    pub max_connections_per_ip: usize,

    #[serde(alias = "faucetSecret", alias = "powSessionSecret")]
    pub faucet_secret: String,
    #[serde(alias = "faucetTitle")]
    pub faucet_title: String,
    /// Reject new sessions with this message when set
    #[serde(alias = "denyNewSessions")]
    pub deny_new_sessions: Option<String>,

    #[serde(alias = "powShareReward")]
    pub pow_share_reward: u128,
    #[serde(alias = "claimMinAmount")]
    pub claim_min_amount: u128,
    #[serde(alias = "claimMaxAmount")]
    pub claim_max_amount: u128,

    #[serde(alias = "powSessionTimeout")]
    pub pow_session_timeout: u64,
    #[serde(alias = "powIdleTimeout")]
    pub pow_idle_timeout: u64,
    #[serde(alias = "claimSessionTimeout")]
    pub claim_session_timeout: u64,
    #[serde(alias = "closedSessionMargin")]
    pub closed_session_margin: u64,
    #[serde(alias = "claimAddrCooldown")]
    pub claim_addr_cooldown: u64,
    #[serde(alias = "concurrentSessions")]
    pub concurrent_sessions: usize,

    #[serde(alias = "powPingInterval")]
    pub pow_ping_interval: u64,
    #[serde(alias = "powPingTimeout")]
    pub pow_ping_timeout: u64,

    #[serde(alias = "powScryptParams")]
    pub pow_scrypt_params: ScryptParams,
    #[serde(alias = "powNonceCount")]
    pub pow_nonce_count: usize,
    #[serde(alias = "powHashrateSoftLimit")]
    pub pow_hashrate_soft_limit: u64,
    #[serde(alias = "powHashrateHardLimit")]
    pub pow_hashrate_hard_limit: u64,

    #[serde(alias = "verifyLocalPercent")]
    pub verify_local_percent: u32,
    #[serde(alias = "verifyLocalMaxQueue")]
    pub verify_local_max_queue: usize,
    #[serde(alias = "verifyMinerPeerCount")]
    pub verify_miner_peer_count: usize,
    #[serde(alias = "verifyLocalLowPeerPercent")]
    pub verify_local_low_peer_percent: u32,
    #[serde(alias = "verifyMinerPercent")]
    pub verify_miner_percent: u32,
    #[serde(alias = "verifyMinerIndividuals")]
    pub verify_miner_individuals: usize,
    #[serde(alias = "verifyMinerMaxPending")]
    pub verify_miner_max_pending: u32,
    #[serde(alias = "verifyMinerMaxMissed")]
    pub verify_miner_max_missed: u32,
    #[serde(alias = "verifyMinerTimeout")]
    pub verify_miner_timeout: u64,
    #[serde(alias = "verifyMinerRewardPerc")]
    pub verify_miner_reward_perc: u32,
    #[serde(alias = "verifyMinerMissPenaltyPerc")]
    pub verify_miner_miss_penalty_perc: u32,

    #[serde(alias = "validatorThreads")]
    pub validator_threads: usize,
    /// Starting balance reported by the in-memory claim queue
    #[serde(alias = "faucetBalance")]
    pub faucet_balance: u128,
    /// Faucet wallet balance threshold -> reward percent
    #[serde(alias = "faucetBalanceRestrictedReward")]
    pub faucet_balance_restriction: BTreeMap<String, u32>,

    /// Parsed and sorted form of `faucet_balance_restriction`
    #[serde(skip)]
    pub balance_restriction_tiers: Vec<(u128, u32)>,
    #[serde(skip)]
    pow_params_str: String,
}

impl Default for FaucetConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            api_listen: "0.0.0.0:9100".to_string(),
            redis_url: None,
            max_connections: 10_000,
            max_connections_per_ip: 32,
            faucet_secret: String::new(),
            faucet_title: "PoW Faucet".to_string(),
            deny_new_sessions: None,
            pow_share_reward: 12_500_000_000_000_000,
            claim_min_amount: 100_000_000_000_000_000,
            claim_max_amount: 10_000_000_000_000_000_000,
            pow_session_timeout: 18_000,
            pow_idle_timeout: 1_800,
            claim_session_timeout: 86_400,
            closed_session_margin: 60,
            claim_addr_cooldown: 7_200,
            concurrent_sessions: 0,
            pow_ping_interval: 10,
            pow_ping_timeout: 30,
            pow_scrypt_params: ScryptParams::default(),
            pow_nonce_count: 1,
            pow_hashrate_soft_limit: 0,
            pow_hashrate_hard_limit: 0,
            verify_local_percent: 10,
            verify_local_max_queue: 100,
            verify_miner_peer_count: 2,
            verify_local_low_peer_percent: 100,
            verify_miner_percent: 100,
            verify_miner_individuals: 2,
            verify_miner_max_pending: 10,
            verify_miner_max_missed: 10,
            verify_miner_timeout: 15,
            verify_miner_reward_perc: 15,
            verify_miner_miss_penalty_perc: 10,
            validator_threads: 2,
            faucet_balance: 1_000_000_000_000_000_000_000,
            faucet_balance_restriction: BTreeMap::new(),
            balance_restriction_tiers: Vec::new(),
            pow_params_str: String::new(),
        }
    }
}

impl FaucetConfig {
    /// Defaults, then `faucet_config.json` (or `$FAUCET_CONFIG`), then env overrides
    pub fn load() -> Self {
        let path = std::env::var("FAUCET_CONFIG").unwrap_or_else(|_| "faucet_config.json".to_string());
        let mut cfg = match std::fs::read_to_string(&path) {
            Ok(txt) => match Self::from_json(&txt) {
                Ok(file_cfg) => {
                    tracing::info!("📄 Loaded faucet config from {}", path);
                    file_cfg
                }
                Err(e) => {
                    tracing::warn!("⚠️ Ignoring unparsable config {}: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        };

        if let Ok(l) = std::env::var("FAUCET_LISTEN") { cfg.listen = l; }
        if let Ok(a) = std::env::var("FAUCET_API_LISTEN") { cfg.api_listen = a; }
        if let Ok(r) = std::env::var("FAUCET_REDIS_URL") {
            cfg.redis_url = Some(r);
        } else if let Ok(r) = std::env::var("REDIS_URL") {
            // legacy
            cfg.redis_url = Some(r);
        }
        if let Ok(s) = std::env::var("FAUCET_SECRET") {
            cfg.faucet_secret = s;
        } else if let Ok(s) = std::env::var("POW_SESSION_SECRET") {
            // legacy
            cfg.faucet_secret = s;
        }
        if let Ok(d) = std::env::var("FAUCET_DENY_NEW_SESSIONS") {
            cfg.deny_new_sessions = if d.is_empty() { None } else { Some(d) };
        }

        cfg.normalize();
        cfg
    }

    /// Parse a JSON document into a normalized config
    pub fn from_json(txt: &str) -> anyhow::Result<Self> {
        let mut cfg: FaucetConfig = serde_json::from_str(txt)?;
        cfg.normalize();
        Ok(cfg)
    }

    /// Fix up derived and legacy values once, right after loading
    pub fn normalize(&mut self) {
        if self.faucet_secret.is_empty() {
            let secret: [u8; 32] = rand::random();
            self.faucet_secret = hex::encode(secret);
            tracing::warn!("⚠️ No faucet secret configured, recovery tokens will not survive a restart");
        }
        if self.verify_local_low_peer_percent < self.verify_local_percent {
            self.verify_local_low_peer_percent = self.verify_local_percent;
        }
        if self.validator_threads == 0 {
            self.validator_threads = 1;
        }
        if self.claim_max_amount < self.claim_min_amount {
            self.claim_max_amount = self.claim_min_amount;
        }

        let mut tiers = Vec::with_capacity(self.faucet_balance_restriction.len());
        for (threshold, perc) in &self.faucet_balance_restriction {
            match threshold.parse::<u128>() {
                Ok(t) => tiers.push((t, (*perc).min(100))),
                Err(_) => tracing::warn!("⚠️ Ignoring invalid balance restriction threshold '{}'", threshold),
            }
        }
        tiers.sort_by_key(|(t, _)| *t);
        self.balance_restriction_tiers = tiers;

        self.pow_params_str = self.pow_scrypt_params.match_string();
    }

    pub fn pow_params_string(&self) -> &str {
        &self.pow_params_str
    }

    /// Reward for answering a verify request correctly
    pub fn verify_reward(&self) -> u128 {
        percent_of(self.pow_share_reward, self.verify_miner_reward_perc)
    }

    /// Penalty for ignoring a verify request; also the minimum balance a verifier needs
    pub fn miss_penalty(&self) -> u128 {
        percent_of(self.pow_share_reward, self.verify_miner_miss_penalty_perc)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.pow_ping_interval.max(1))
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.pow_ping_timeout)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_miner_timeout)
    }

    /// How long a closed session stays around for late claims
    pub fn closed_session_lifetime(&self) -> Duration {
        Duration::from_secs(self.claim_session_timeout + self.closed_session_margin)
    }

    /// TTL for persisted session marks; outlives every token that could reference them
    pub fn session_mark_ttl(&self) -> Duration {
        Duration::from_secs(
            self.claim_session_timeout.max(self.pow_session_timeout) + self.closed_session_margin,
        )
    }
}

/// Floor of `amount * perc / 100`
pub fn percent_of(amount: u128, perc: u32) -> u128 {
    amount.saturating_mul(perc as u128) / 100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_normalized() {
        let mut cfg = FaucetConfig::default();
        cfg.normalize();
        assert_eq!(cfg.pow_params_string(), "4096|8|1|16|9");
        assert_eq!(cfg.faucet_secret.len(), 64);
        assert!(cfg.verify_local_low_peer_percent >= cfg.verify_local_percent);
    }

    #[test]
    fn test_legacy_aliases() {
        let cfg = FaucetConfig::from_json(
            r#"{
                "powSessionSecret": "s3cret",
                "powShareReward": 1000,
                "powScryptParams": {"cpuAndMemory": 2048, "blockSize": 4, "paralellization": 2, "keyLength": 16, "difficulty": 11},
                "verifyLocalPercent": 50,
                "verifyLocalLowPeerPercent": 20
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.faucet_secret, "s3cret");
        assert_eq!(cfg.pow_share_reward, 1000);
        assert_eq!(cfg.pow_scrypt_params.parallelization, 2);
        assert_eq!(cfg.pow_params_string(), "2048|4|2|16|11");
        // low-peer percent never undercuts the base percent
        assert_eq!(cfg.verify_local_low_peer_percent, 50);
    }

    #[test]
    fn test_large_amounts_and_tiers() {
        let cfg = FaucetConfig::from_json(
            r#"{
                "claim_max_amount": 50000000000000000000,
                "faucet_balance_restriction": {"5000": 50, "1000": 10, "junk": 5}
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.claim_max_amount, 50_000_000_000_000_000_000);
        assert_eq!(cfg.balance_restriction_tiers, vec![(1000, 10), (5000, 50)]);
    }

    #[test]
    fn test_derived_amounts_floor() {
        let mut cfg = FaucetConfig::default();
        cfg.pow_share_reward = 999;
        cfg.verify_miner_reward_perc = 15;
        cfg.verify_miner_miss_penalty_perc = 10;
        assert_eq!(cfg.verify_reward(), 149);
        assert_eq!(cfg.miss_penalty(), 99);
        assert_eq!(percent_of(7, 50), 3);
    }
}
