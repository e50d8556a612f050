/// Share verification coordinator
///
/// Flow per submitted share:
/// 1. Pick a strategy: local validator, peer redistribution or plain accept
/// 2. For peers: push `verify` requests and wait for answers or the timeout
/// 3. Re-check locally whenever a peer reported invalid or stayed silent
/// 4. Penalize silent peers, slash liars, then slash or reward the submitter

use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use super::validator::ShareValidator;
use crate::error::{FaucetError, FaucetResult};
use crate::metrics::prometheus as metrics;
use crate::protocol::verify_push;
use crate::rewards::RewardLimiter;
use crate::session::{MinerSession, SessionManager, SlashReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationResult {
    pub is_valid: bool,
    pub reward: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Strategy {
    Local,
    Peers(Vec<String>),
    Accept,
}

/// In-flight peer verification, keyed by share id
struct PendingShare {
    submitter: String,
    /// Asked but not yet answered
    remaining: HashSet<String>,
    results: HashMap<String, bool>,
    is_invalid: bool,
    done: Option<oneshot::Sender<()>>,
}

pub struct ShareVerifier {
    sessions: Arc<SessionManager>,
    validator: Arc<dyn ShareValidator>,
    rewards: Arc<dyn RewardLimiter>,
    in_flight: Mutex<HashMap<String, PendingShare>>,
}

impl ShareVerifier {
    pub fn new(
        sessions: Arc<SessionManager>,
        validator: Arc<dyn ShareValidator>,
        rewards: Arc<dyn RewardLimiter>,
    ) -> Self {
        Self { sessions, validator, rewards, in_flight: Mutex::new(HashMap::new()) }
    }

    pub fn validator(&self) -> &Arc<dyn ShareValidator> {
        &self.validator
    }

    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    fn choose_strategy(&self, pool: &[String]) -> Strategy {
        let cfg = self.sessions.config();
        let mut rng = rand::thread_rng();

        let local_percent = if pool.len() < cfg.verify_miner_peer_count {
            cfg.verify_local_low_peer_percent
        } else {
            cfg.verify_local_percent
        };
        if rng.gen_range(0..100) < local_percent && self.validator.queue_len() < cfg.verify_local_max_queue {
            return Strategy::Local;
        }

        if cfg.verify_miner_percent > 0
            && cfg.verify_miner_individuals > 0
            && !pool.is_empty()
            && pool.len() >= cfg.verify_miner_peer_count
            && rng.gen_range(0..100) < cfg.verify_miner_percent
        {
            let chosen = pool
                .choose_multiple(&mut rng, cfg.verify_miner_individuals)
                .cloned()
                .collect();
            return Strategy::Peers(chosen);
        }

        Strategy::Accept
    }

    /// Verify one share submitted by `session` (snapshot taken after its nonces were recorded)
    pub async fn start_verification(&self, session: &MinerSession, nonces: &[u64]) -> FaucetResult<VerificationResult> {
        let pool = self.sessions.verifier_pool(&session.id).await;
        let strategy = self.choose_strategy(&pool);

        let is_invalid = match strategy {
            Strategy::Local => {
                tracing::debug!("Share of {} verified locally", session.id);
                match self.check_locally(session, nonces).await {
                    Some(valid) => !valid,
                    None => false,
                }
            }
            Strategy::Peers(chosen) => {
                tracing::debug!("Share of {} redistributed to {} peer(s)", session.id, chosen.len());
                self.verify_with_peers(session, nonces, &chosen).await
            }
            Strategy::Accept => {
                tracing::debug!("Share of {} accepted without verification", session.id);
                false
            }
        };

        self.finalize(session, is_invalid).await
    }

    /// `None` when the validator failed; callers then accept the share
    async fn check_locally(&self, session: &MinerSession, nonces: &[u64]) -> Option<bool> {
        metrics::inc_local_verifications();
        match self.validator.validate(&session.preimage, nonces).await {
            Ok(valid) => Some(valid),
            Err(e) => {
                tracing::warn!("⚠️ Validator unavailable for share of {}: {} (accepting)", session.id, e);
                None
            }
        }
    }

    async fn verify_with_peers(&self, session: &MinerSession, nonces: &[u64], chosen: &[String]) -> bool {
        let assigned = self.sessions.assign_verifiers(chosen).await;
        if assigned.is_empty() {
            return false;
        }

        let share_id = Uuid::new_v4().to_string();
        let (done_tx, done_rx) = oneshot::channel();
        self.in_flight.lock().await.insert(
            share_id.clone(),
            PendingShare {
                submitter: session.id.clone(),
                remaining: assigned.iter().map(|(id, _)| id.clone()).collect(),
                results: HashMap::new(),
                is_invalid: false,
                done: Some(done_tx),
            },
        );

        let request = verify_push(&share_id, &session.preimage, nonces);
        for (_, client) in &assigned {
            client.send(&request);
        }
        metrics::inc_verify_requests_by(assigned.len() as u64);

        let timeout = self.sessions.config().verify_timeout();
        if tokio::time::timeout(timeout, done_rx).await.is_err() {
            tracing::debug!("Verify request {} timed out", share_id);
        }

        let Some(pending) = self.in_flight.lock().await.remove(&share_id) else {
            return false;
        };

        let mut is_invalid = pending.is_invalid;
        let mut authoritative = false;
        if pending.is_invalid || !pending.remaining.is_empty() {
            // peers disagreed with the submitter or stayed silent
            if let Some(valid) = self.check_locally(session, nonces).await {
                is_invalid = !valid;
                authoritative = true;
            } else {
                is_invalid = false;
            }
        }

        let miss_penalty = self.sessions.config().miss_penalty();
        for peer in &pending.remaining {
            self.sessions.finish_verification(peer, true).await;
            metrics::inc_verify_misses();
            tracing::warn!("⚠️ Peer {} missed verify request {}", peer, share_id);
            if miss_penalty > 0 {
                self.sessions.add_penalty(peer, miss_penalty, "verify miss").await;
            }
        }

        if authoritative {
            for (peer, reported_valid) in &pending.results {
                if *reported_valid == is_invalid {
                    self.sessions.slash(peer, SlashReason::InvalidVerification).await;
                }
            }
        }

        is_invalid
    }

    async fn finalize(&self, session: &MinerSession, is_invalid: bool) -> FaucetResult<VerificationResult> {
        if is_invalid {
            self.sessions.slash(&session.id, SlashReason::InvalidShare).await;
            return Ok(VerificationResult { is_valid: false, reward: 0 });
        }

        let current = self.sessions.session(&session.id).await.ok_or(FaucetError::VerifyFailed)?;
        let reward = self.rewards.share_reward(&current).await;
        self.sessions
            .add_reward(&session.id, reward, "valid share")
            .await
            .ok_or(FaucetError::VerifyFailed)?;

        metrics::inc_shares_accepted();
        metrics::add_share_rewards(reward);
        Ok(VerificationResult { is_valid: true, reward })
    }

    /// Record a peer's answer. False when the peer was never asked or already answered.
    pub async fn process_verification_result(&self, share_id: &str, verifier_id: &str, is_valid: bool) -> bool {
        {
            let mut in_flight = self.in_flight.lock().await;
            let Some(pending) = in_flight.get_mut(share_id) else {
                return false;
            };
            if !pending.remaining.remove(verifier_id) {
                return false;
            }
            pending.results.insert(verifier_id.to_string(), is_valid);
            if !is_valid {
                pending.is_invalid = true;
                tracing::debug!("Peer {} reported share {} of {} invalid", verifier_id, share_id, pending.submitter);
            }
            if pending.remaining.is_empty() {
                if let Some(done) = pending.done.take() {
                    let _ = done.send(());
                }
            }
        }
        self.sessions.finish_verification(verifier_id, false).await;
        true
    }

    /// Pay an answering peer its verification reward
    pub async fn reward_verifier(&self, verifier_id: &str) -> Option<u128> {
        let session = self.sessions.session(verifier_id).await?;
        let reward = self.rewards.verification_reward(&session).await;
        if reward == 0 {
            return None;
        }
        self.sessions.add_reward(verifier_id, reward, "valid verification").await?;
        metrics::add_verify_rewards(reward);
        Some(reward)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FaucetConfig;
    use crate::payout::ClaimQueue;
    use crate::protocol::{ClientHandle, ServerMessage};
    use crate::rewards::StaticRewardLimiter;
    use crate::session::{SessionOrigin, SessionStatus};
    use crate::storage::{MarkStore, MemoryMarkStore, SessionMark};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    const ADDR: &str = "0x2222222222222222222222222222222222222222";

    struct FixedValidator {
        verdict: Option<bool>,
        calls: AtomicUsize,
    }

    impl FixedValidator {
        fn new(verdict: Option<bool>) -> Arc<Self> {
            Arc::new(Self { verdict, calls: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl ShareValidator for FixedValidator {
        fn queue_len(&self) -> usize {
            0
        }

        async fn validate(&self, _preimage: &str, _nonces: &[u64]) -> anyhow::Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.verdict.ok_or_else(|| anyhow!("validator down"))
        }
    }

    fn local_config() -> FaucetConfig {
        let mut cfg = FaucetConfig::default();
        cfg.faucet_secret = "verify-secret".into();
        cfg.pow_share_reward = 1000;
        cfg.verify_miner_miss_penalty_perc = 10;
        cfg.verify_miner_reward_perc = 15;
        cfg.verify_local_percent = 100;
        cfg.verify_miner_percent = 0;
        cfg.normalize();
        cfg
    }

    fn peer_config() -> FaucetConfig {
        let mut cfg = local_config();
        cfg.verify_local_percent = 0;
        cfg.verify_local_low_peer_percent = 0;
        cfg.verify_miner_percent = 100;
        cfg.verify_miner_peer_count = 1;
        cfg.verify_miner_individuals = 1;
        cfg.verify_miner_timeout = 10;
        cfg
    }

    struct Harness {
        sessions: Arc<SessionManager>,
        verifier: Arc<ShareVerifier>,
        validator: Arc<FixedValidator>,
        marks: Arc<MemoryMarkStore>,
    }

    fn harness(cfg: FaucetConfig, verdict: Option<bool>) -> Harness {
        let cfg = Arc::new(cfg);
        let marks = Arc::new(MemoryMarkStore::new());
        let sessions = SessionManager::new(cfg.clone(), marks.clone()).unwrap();
        let validator = FixedValidator::new(verdict);
        let rewards = Arc::new(StaticRewardLimiter::new(cfg, Arc::new(ClaimQueue::new(0))));
        let verifier = Arc::new(ShareVerifier::new(sessions.clone(), validator.clone(), rewards));
        Harness { sessions, verifier, validator, marks }
    }

    async fn join(h: &Harness, conn_id: u64, balance: u128) -> (MinerSession, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = ClientHandle::new(conn_id, tx);
        let session = h
            .sessions
            .create_session(&client, SessionOrigin::New { target_addr: ADDR.into() }, None)
            .await
            .unwrap();
        if balance > 0 {
            h.sessions.add_reward(&session.id, balance, "seed").await;
        }
        (session, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(line) = rx.try_recv() {
            out.push(serde_json::from_str(line.trim()).unwrap());
        }
        out
    }

    async fn next_verify(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        loop {
            let line = rx.recv().await.unwrap();
            let msg: ServerMessage = serde_json::from_str(line.trim()).unwrap();
            if msg.action == "verify" {
                return msg.data.unwrap()["shareId"].as_str().unwrap().to_string();
            }
        }
    }

    #[tokio::test]
    async fn test_local_valid_share_rewarded() {
        let h = harness(local_config(), Some(true));
        let (submitter, mut rx) = join(&h, 1, 0).await;
        let snapshot = h.sessions.record_share(1, &[10], None).await.unwrap();

        let result = h.verifier.start_verification(&snapshot, &[10]).await.unwrap();
        assert_eq!(result, VerificationResult { is_valid: true, reward: 1000 });
        assert_eq!(h.sessions.session(&submitter.id).await.unwrap().balance, 1000);
        assert_eq!(h.validator.calls.load(Ordering::SeqCst), 1);

        let pushes = drain(&mut rx);
        let update = pushes.iter().find(|m| m.action == "updateBalance").unwrap();
        assert_eq!(update.data.as_ref().unwrap()["reason"], "valid share");
    }

    #[tokio::test]
    async fn test_local_invalid_share_slashes_submitter() {
        let h = harness(local_config(), Some(false));
        let (submitter, _rx) = join(&h, 1, 400).await;
        let snapshot = h.sessions.record_share(1, &[10], None).await.unwrap();

        let result = h.verifier.start_verification(&snapshot, &[10]).await.unwrap();
        assert!(!result.is_valid);
        let s = h.sessions.find_session(&submitter.id).await.unwrap();
        assert_eq!(s.status, SessionStatus::Slashed);
        assert_eq!(s.balance, 400);
    }

    #[tokio::test]
    async fn test_validator_failure_degrades_to_accept() {
        let h = harness(local_config(), None);
        let (submitter, _rx) = join(&h, 1, 0).await;
        let snapshot = h.sessions.record_share(1, &[10], None).await.unwrap();

        let result = h.verifier.start_verification(&snapshot, &[10]).await.unwrap();
        assert!(result.is_valid);
        assert_eq!(h.sessions.session(&submitter.id).await.unwrap().status, SessionStatus::Mining);
    }

    #[tokio::test]
    async fn test_accept_without_peers_or_local() {
        let mut cfg = peer_config();
        cfg.verify_miner_peer_count = 3;
        let h = harness(cfg, Some(false));
        let (submitter, _rx) = join(&h, 1, 0).await;
        let snapshot = h.sessions.record_share(1, &[10], None).await.unwrap();

        let result = h.verifier.start_verification(&snapshot, &[10]).await.unwrap();
        assert!(result.is_valid);
        assert_eq!(h.validator.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.sessions.session(&submitter.id).await.unwrap().balance, 1000);
    }

    #[tokio::test]
    async fn test_honest_peer_confirms_and_is_paid() {
        let h = harness(peer_config(), Some(false));
        let (_submitter, _rx) = join(&h, 1, 0).await;
        let (peer, mut peer_rx) = join(&h, 2, 500).await;
        let snapshot = h.sessions.record_share(1, &[10], None).await.unwrap();

        let verifier = h.verifier.clone();
        let task = tokio::spawn(async move { verifier.start_verification(&snapshot, &[10]).await });

        let share_id = next_verify(&mut peer_rx).await;
        assert!(h.verifier.process_verification_result(&share_id, &peer.id, true).await);
        assert_eq!(h.verifier.reward_verifier(&peer.id).await, Some(150));

        let result = task.await.unwrap().unwrap();
        assert!(result.is_valid);
        // no disagreement, so the local validator was never asked
        assert_eq!(h.validator.calls.load(Ordering::SeqCst), 0);
        let p = h.sessions.session(&peer.id).await.unwrap();
        assert_eq!(p.balance, 650);
        assert_eq!(p.pending_verifications, 0);
        assert_eq!(h.verifier.in_flight_count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_results_ignored() {
        let h = harness(peer_config(), Some(true));
        let (_submitter, _rx) = join(&h, 1, 0).await;
        let (peer, mut peer_rx) = join(&h, 2, 500).await;
        let (outsider, _orx) = join(&h, 3, 0).await;
        let snapshot = h.sessions.record_share(1, &[10], None).await.unwrap();

        let verifier = h.verifier.clone();
        let task = tokio::spawn(async move { verifier.start_verification(&snapshot, &[10]).await });
        let share_id = next_verify(&mut peer_rx).await;

        assert!(!h.verifier.process_verification_result("unknown", &peer.id, true).await);
        assert!(!h.verifier.process_verification_result(&share_id, &outsider.id, false).await);
        assert!(h.verifier.process_verification_result(&share_id, &peer.id, true).await);
        task.await.unwrap().unwrap();
        assert!(!h.verifier.process_verification_result(&share_id, &peer.id, false).await);
        assert_eq!(h.sessions.session(&peer.id).await.unwrap().balance, 500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_penalized_submitter_rechecked() {
        let h = harness(peer_config(), Some(true));
        let (submitter, _rx) = join(&h, 1, 0).await;
        let (peer, mut peer_rx) = join(&h, 2, 150).await;
        let snapshot = h.sessions.record_share(1, &[10], None).await.unwrap();

        let verifier = h.verifier.clone();
        let task = tokio::spawn(async move { verifier.start_verification(&snapshot, &[10]).await });
        next_verify(&mut peer_rx).await;
        tokio::time::sleep(Duration::from_secs(11)).await;

        let result = task.await.unwrap().unwrap();
        assert!(result.is_valid);
        assert_eq!(h.validator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.sessions.session(&submitter.id).await.unwrap().balance, 1000);

        let p = h.sessions.session(&peer.id).await.unwrap();
        assert_eq!(p.missed_verifications, 1);
        assert_eq!(p.pending_verifications, 0);
        assert_eq!(p.balance, 50);
        let pushes = drain(&mut peer_rx);
        let miss = pushes.iter().find(|m| m.action == "updateBalance").unwrap();
        assert_eq!(miss.data.as_ref().unwrap()["reason"], "verify miss (penalty: 100)");
    }

    #[tokio::test]
    async fn test_lying_peer_slashed_by_local_recheck() {
        // peer claims invalid, validator says valid
        let h = harness(peer_config(), Some(true));
        let (submitter, _rx) = join(&h, 1, 0).await;
        let (peer, mut peer_rx) = join(&h, 2, 5000).await;
        let snapshot = h.sessions.record_share(1, &[10], None).await.unwrap();

        let verifier = h.verifier.clone();
        let task = tokio::spawn(async move { verifier.start_verification(&snapshot, &[10]).await });
        let share_id = next_verify(&mut peer_rx).await;
        assert!(h.verifier.process_verification_result(&share_id, &peer.id, false).await);

        let result = task.await.unwrap().unwrap();
        assert!(result.is_valid);
        assert_eq!(h.sessions.find_session(&peer.id).await.unwrap().status, SessionStatus::Slashed);
        assert_eq!(h.sessions.session(&submitter.id).await.unwrap().balance, 1000);
        assert_eq!(
            h.marks.session_marks(&peer.id).await.unwrap(),
            vec![SessionMark::Killed]
        );
    }

    #[tokio::test]
    async fn test_peer_vouching_for_bad_share_is_slashed() {
        // one peer claims valid, the other invalid, validator says invalid
        let mut cfg = peer_config();
        cfg.verify_miner_peer_count = 2;
        cfg.verify_miner_individuals = 2;
        let h = harness(cfg, Some(false));
        let (submitter, _rx) = join(&h, 1, 0).await;
        let (liar, mut liar_rx) = join(&h, 2, 500).await;
        let (honest, mut honest_rx) = join(&h, 3, 500).await;
        let snapshot = h.sessions.record_share(1, &[10], None).await.unwrap();

        let verifier = h.verifier.clone();
        let task = tokio::spawn(async move { verifier.start_verification(&snapshot, &[10]).await });
        let share_id = next_verify(&mut liar_rx).await;
        assert_eq!(next_verify(&mut honest_rx).await, share_id);
        assert!(h.verifier.process_verification_result(&share_id, &liar.id, true).await);
        assert!(h.verifier.process_verification_result(&share_id, &honest.id, false).await);

        let result = task.await.unwrap().unwrap();
        assert!(!result.is_valid);
        assert_eq!(h.validator.calls.load(Ordering::SeqCst), 1);

        assert_eq!(h.sessions.find_session(&liar.id).await.unwrap().status, SessionStatus::Slashed);
        assert_eq!(h.marks.session_marks(&liar.id).await.unwrap(), vec![SessionMark::Killed]);

        let kept = h.sessions.session(&honest.id).await.unwrap();
        assert_eq!(kept.status, SessionStatus::Mining);
        assert_eq!(kept.pending_verifications, 0);
        assert!(h.marks.session_marks(&honest.id).await.unwrap().is_empty());

        assert_eq!(h.sessions.find_session(&submitter.id).await.unwrap().status, SessionStatus::Slashed);
    }

    #[tokio::test]
    async fn test_validator_outage_during_recheck_slashes_nobody() {
        let h = harness(peer_config(), None);
        let (submitter, _rx) = join(&h, 1, 0).await;
        let (peer, mut peer_rx) = join(&h, 2, 500).await;
        let snapshot = h.sessions.record_share(1, &[10], None).await.unwrap();

        let verifier = h.verifier.clone();
        let task = tokio::spawn(async move { verifier.start_verification(&snapshot, &[10]).await });
        let share_id = next_verify(&mut peer_rx).await;
        h.verifier.process_verification_result(&share_id, &peer.id, false).await;

        assert!(task.await.unwrap().unwrap().is_valid);
        assert_eq!(h.sessions.session(&peer.id).await.unwrap().status, SessionStatus::Mining);
        assert_eq!(h.sessions.session(&submitter.id).await.unwrap().status, SessionStatus::Mining);
    }
}
