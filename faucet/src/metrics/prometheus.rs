use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};
use std::sync::OnceLock;

static SESSIONS_CREATED: OnceLock<IntCounter> = OnceLock::new();
static SESSIONS_CLOSED: OnceLock<IntCounter> = OnceLock::new();
static SESSIONS_SLASHED: OnceLock<IntCounterVec> = OnceLock::new();

static SHARES_ACCEPTED: OnceLock<IntCounter> = OnceLock::new();
static SHARES_REJECTED: OnceLock<IntCounterVec> = OnceLock::new();
static SHARE_REWARDS: OnceLock<IntCounter> = OnceLock::new();
static VERIFY_REWARDS: OnceLock<IntCounter> = OnceLock::new();

static VERIFY_REQUESTS: OnceLock<IntCounter> = OnceLock::new();
static VERIFY_MISSES: OnceLock<IntCounter> = OnceLock::new();
static LOCAL_VERIFICATIONS: OnceLock<IntCounter> = OnceLock::new();

static CLAIMS_QUEUED: OnceLock<IntCounter> = OnceLock::new();

static ACTIVE_CONNECTIONS: OnceLock<IntGauge> = OnceLock::new();
static ACTIVE_SESSIONS: OnceLock<IntGauge> = OnceLock::new();
static VALIDATOR_QUEUE: OnceLock<IntGauge> = OnceLock::new();

fn sessions_created() -> &'static IntCounter {
    SESSIONS_CREATED.get_or_init(|| {
        IntCounter::new("faucet_sessions_created_total", "Total sessions created or recovered").unwrap()
    })
}

fn sessions_closed() -> &'static IntCounter {
    SESSIONS_CLOSED
        .get_or_init(|| IntCounter::new("faucet_sessions_closed_total", "Total sessions closed").unwrap())
}

fn sessions_slashed() -> &'static IntCounterVec {
    SESSIONS_SLASHED.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("faucet_sessions_slashed_total", "Total sessions slashed by reason"),
            &["reason"],
        )
        .unwrap()
    })
}

fn shares_accepted() -> &'static IntCounter {
    SHARES_ACCEPTED
        .get_or_init(|| IntCounter::new("faucet_shares_accepted_total", "Total rewarded shares").unwrap())
}

fn shares_rejected() -> &'static IntCounterVec {
    SHARES_REJECTED.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("faucet_shares_rejected_total", "Total rejected shares by error code"),
            &["code"],
        )
        .unwrap()
    })
}

// u128 amounts are reported in gwei so they fit an integer counter
fn share_rewards() -> &'static IntCounter {
    SHARE_REWARDS.get_or_init(|| {
        IntCounter::new("faucet_share_rewards_gwei_total", "Share rewards credited (gwei)").unwrap()
    })
}

fn verify_rewards() -> &'static IntCounter {
    VERIFY_REWARDS.get_or_init(|| {
        IntCounter::new("faucet_verify_rewards_gwei_total", "Verification rewards credited (gwei)").unwrap()
    })
}

fn verify_requests() -> &'static IntCounter {
    VERIFY_REQUESTS.get_or_init(|| {
        IntCounter::new("faucet_verify_requests_total", "Verify requests pushed to peers").unwrap()
    })
}

fn verify_misses() -> &'static IntCounter {
    VERIFY_MISSES.get_or_init(|| {
        IntCounter::new("faucet_verify_misses_total", "Verify requests peers never answered").unwrap()
    })
}

fn local_verifications() -> &'static IntCounter {
    LOCAL_VERIFICATIONS.get_or_init(|| {
        IntCounter::new("faucet_local_verifications_total", "Shares checked by the local validator").unwrap()
    })
}

fn claims_queued() -> &'static IntCounter {
    CLAIMS_QUEUED
        .get_or_init(|| IntCounter::new("faucet_claims_queued_total", "Claims handed to the payout queue").unwrap())
}

fn active_connections() -> &'static IntGauge {
    ACTIVE_CONNECTIONS
        .get_or_init(|| IntGauge::new("faucet_active_connections", "Open client connections").unwrap())
}

fn active_sessions() -> &'static IntGauge {
    ACTIVE_SESSIONS
        .get_or_init(|| IntGauge::new("faucet_active_sessions", "Sessions in the active index").unwrap())
}

fn validator_queue() -> &'static IntGauge {
    VALIDATOR_QUEUE
        .get_or_init(|| IntGauge::new("faucet_validator_queue", "Jobs waiting on the PoW validator").unwrap())
}

fn gwei(amount: u128) -> u64 {
    u64::try_from(amount / 1_000_000_000).unwrap_or(u64::MAX)
}

pub fn inc_sessions_created() {
    sessions_created().inc();
}

pub fn inc_sessions_closed() {
    sessions_closed().inc();
}

pub fn inc_sessions_slashed(reason: &str) {
    sessions_slashed().with_label_values(&[reason]).inc();
}

pub fn inc_shares_accepted() {
    shares_accepted().inc();
}

pub fn inc_shares_rejected(code: &str) {
    shares_rejected().with_label_values(&[code]).inc();
}

pub fn add_share_rewards(amount: u128) {
    share_rewards().inc_by(gwei(amount));
}

pub fn add_verify_rewards(amount: u128) {
    verify_rewards().inc_by(gwei(amount));
}

pub fn inc_verify_requests_by(n: u64) {
    verify_requests().inc_by(n);
}

pub fn inc_verify_misses() {
    verify_misses().inc();
}

pub fn inc_local_verifications() {
    local_verifications().inc();
}

pub fn inc_claims_queued() {
    claims_queued().inc();
}

pub fn inc_connections() {
    active_connections().inc();
}

pub fn dec_connections() {
    active_connections().dec();
}

pub fn set_active_sessions(count: usize) {
    active_sessions().set(count as i64);
}

pub fn set_validator_queue(depth: usize) {
    validator_queue().set(depth as i64);
}

pub fn render() -> String {
    let enc = TextEncoder::new();
    let mut mfs = Vec::new();

    mfs.extend(sessions_created().collect());
    mfs.extend(sessions_closed().collect());
    mfs.extend(sessions_slashed().collect());
    mfs.extend(shares_accepted().collect());
    mfs.extend(shares_rejected().collect());
    mfs.extend(share_rewards().collect());
    mfs.extend(verify_rewards().collect());
    mfs.extend(verify_requests().collect());
    mfs.extend(verify_misses().collect());
    mfs.extend(local_verifications().collect());
    mfs.extend(claims_queued().collect());
    mfs.extend(active_connections().collect());
    mfs.extend(active_sessions().collect());
    mfs.extend(validator_queue().collect());

    let mut buf = Vec::new();
    let _ = enc.encode(&mfs, &mut buf);
    String::from_utf8_lossy(&buf).to_string()
}
