/// Share Validator - PoW checks on a worker thread pool
///
/// Hashing runs on a rayon pool; async callers spawn a job onto it and
/// await a oneshot reply. The queue depth is tracked on the async side
/// so the verification strategy can back off when the pool is saturated.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::config::ScryptParams;
use crate::metrics::prometheus as metrics;

/// Validity oracle for submitted shares
#[async_trait]
pub trait ShareValidator: Send + Sync {
    /// Jobs submitted but not yet answered
    fn queue_len(&self) -> usize;

    /// True when every nonce solves the puzzle for `preimage` (base64)
    async fn validate(&self, preimage: &str, nonces: &[u64]) -> Result<bool>;
}

/// Hash function used by the worker pool
pub trait ShareHasher: Send + Sync + 'static {
    fn hash(&self, nonce: u64, preimage: &[u8]) -> Result<Vec<u8>>;
}

pub struct ScryptHasher {
    params: scrypt::Params,
    key_length: usize,
}

impl ScryptHasher {
    pub fn new(params: &ScryptParams) -> Result<Self> {
        if !params.cpu_and_memory.is_power_of_two() {
            return Err(anyhow!("scrypt N must be a power of two, got {}", params.cpu_and_memory));
        }
        let log_n = params.cpu_and_memory.trailing_zeros() as u8;
        let key_length = params.key_length as usize;
        let params = scrypt::Params::new(log_n, params.block_size, params.parallelization, key_length)
            .map_err(|e| anyhow!("Invalid scrypt params: {}", e))?;
        Ok(Self { params, key_length })
    }
}

impl ShareHasher for ScryptHasher {
    fn hash(&self, nonce: u64, preimage: &[u8]) -> Result<Vec<u8>> {
        // nonce is the big-endian form of its 16-char hex encoding
        let password = nonce.to_be_bytes();
        let mut output = vec![0u8; self.key_length];
        scrypt::scrypt(&password, preimage, &self.params, &mut output)
            .map_err(|e| anyhow!("scrypt failed: {}", e))?;
        Ok(output)
    }
}

/// Leading `d/8 + 1` bytes, read big-endian, must not exceed `2^(8*(d/8+1) - d)`
pub fn meets_difficulty(hash: &[u8], difficulty: u32) -> bool {
    let byte_count = (difficulty / 8 + 1) as usize;
    if byte_count > hash.len() || byte_count > 15 {
        return false;
    }
    let prefix = hash[..byte_count]
        .iter()
        .fold(0u128, |acc, b| (acc << 8) | *b as u128);
    let max = 1u128 << (8 * byte_count as u32 - difficulty);
    prefix <= max
}

fn check_nonces(hasher: &dyn ShareHasher, difficulty: u32, preimage: &[u8], nonces: &[u64]) -> Result<bool> {
    if nonces.is_empty() {
        return Ok(false);
    }
    for &nonce in nonces {
        let hash = hasher.hash(nonce, preimage)?;
        if !meets_difficulty(&hash, difficulty) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Decrements the queue depth however the awaiting future ends
struct QueueSlot<'a>(&'a AtomicUsize);

impl<'a> QueueSlot<'a> {
    fn take(counter: &'a AtomicUsize) -> Self {
        let depth = counter.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_validator_queue(depth);
        Self(counter)
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        let depth = self.0.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        metrics::set_validator_queue(depth);
    }
}

pub struct PowValidator {
    pool: rayon::ThreadPool,
    hasher: Arc<dyn ShareHasher>,
    difficulty: u32,
    queue: AtomicUsize,
}

impl PowValidator {
    /// Scrypt validator with `threads` workers
    pub fn new(params: &ScryptParams, threads: usize) -> Result<Self> {
        let hasher = ScryptHasher::new(params)?;
        Self::with_hasher(hasher, params.difficulty, threads)
    }

    pub fn with_hasher<H: ShareHasher>(hasher: H, difficulty: u32, threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("pow-validator-{}", i))
            .build()
            .map_err(|e| anyhow!("Failed to build validator pool: {}", e))?;

        tracing::info!(
            "✅ PoW validator started with {} worker(s), difficulty {}",
            pool.current_num_threads(),
            difficulty
        );
        Ok(Self {
            pool,
            hasher: Arc::new(hasher),
            difficulty,
            queue: AtomicUsize::new(0),
        })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

#[async_trait]
impl ShareValidator for PowValidator {
    fn queue_len(&self) -> usize {
        self.queue.load(Ordering::SeqCst)
    }

    async fn validate(&self, preimage: &str, nonces: &[u64]) -> Result<bool> {
        if nonces.is_empty() {
            return Ok(false);
        }
        let preimage = STANDARD
            .decode(preimage)
            .map_err(|e| anyhow!("Invalid preimage: {}", e))?;

        let _slot = QueueSlot::take(&self.queue);
        let (reply, answer) = oneshot::channel();
        let hasher = Arc::clone(&self.hasher);
        let difficulty = self.difficulty;
        let nonces = nonces.to_vec();
        self.pool.spawn(move || {
            let _ = reply.send(check_nonces(hasher.as_ref(), difficulty, &preimage, &nonces));
        });
        answer.await.map_err(|_| anyhow!("validator worker dropped the job"))?
    }
}
