//! Bounded leading-zero search.
//!
//! This is a rate limiter on appends, not consensus: any node can produce a
//! valid nonce in milliseconds at the default difficulty.

use crate::core::block::{block_hash_input, BlockData};
use crate::error::{LedgerError, Result};
use crate::utils::sha256_hex;
use std::time::{Duration, Instant};

// Check the wall clock once per batch instead of every hash
const CLOCK_CHECK_INTERVAL: u64 = 1024;

pub struct ProofOfWork {
    index: u64,
    previous_hash: String,
    timestamp: i64,
    data_bytes: Vec<u8>,
    difficulty: usize,
}

impl ProofOfWork {
    pub fn new(
        index: u64,
        previous_hash: &str,
        timestamp: i64,
        data: &BlockData,
        difficulty: usize,
    ) -> Result<ProofOfWork> {
        Ok(ProofOfWork {
            index,
            previous_hash: previous_hash.to_string(),
            timestamp,
            data_bytes: data.canonical_bytes()?,
            difficulty,
        })
    }

    /// True when the hex digest starts with `difficulty` zero characters
    pub fn meets_difficulty(hash: &str, difficulty: usize) -> bool {
        hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
    }

    fn prepare_data(&self, nonce: u64) -> Vec<u8> {
        block_hash_input(
            self.index,
            &self.previous_hash,
            self.timestamp,
            &self.data_bytes,
            nonce,
        )
    }

    /// Increment the nonce from 0 until the hash satisfies the difficulty,
    /// giving up after `max_nonce` attempts or `timeout`.
    pub fn run(&self, max_nonce: u64, timeout: Duration) -> Result<(u64, String)> {
        let started = Instant::now();
        let mut nonce = 0u64;

        while nonce < max_nonce {
            let hash = sha256_hex(&self.prepare_data(nonce));
            if Self::meets_difficulty(&hash, self.difficulty) {
                return Ok((nonce, hash));
            }
            nonce += 1;

            if nonce % CLOCK_CHECK_INTERVAL == 0 && started.elapsed() >= timeout {
                break;
            }
        }

        Err(LedgerError::MiningTimeout {
            index: self.index,
            attempts: nonce,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::LedgerOperation;

    fn data() -> BlockData {
        BlockData {
            operation: LedgerOperation::UpdateRecord,
            record_id: "rec-7".to_string(),
            patient_uid: "UID".to_string(),
            hospital_id: "RS-A".to_string(),
            data_hash: "ab".repeat(32),
            version: 2,
        }
    }

    #[test]
    fn test_meets_difficulty() {
        assert!(ProofOfWork::meets_difficulty("00ab", 2));
        assert!(!ProofOfWork::meets_difficulty("0a0b", 2));
        assert!(ProofOfWork::meets_difficulty("abcd", 0));
        assert!(!ProofOfWork::meets_difficulty("0", 2));
    }

    #[test]
    fn test_run_finds_valid_nonce() {
        let pow = ProofOfWork::new(1, "prev", 1_000, &data(), 2).unwrap();
        let (nonce, hash) = pow.run(10_000_000, Duration::from_secs(30)).unwrap();

        assert!(hash.starts_with("00"));
        assert_eq!(sha256_hex(&pow.prepare_data(nonce)), hash);
    }

    #[test]
    fn test_run_is_deterministic_for_same_inputs() {
        let a = ProofOfWork::new(1, "prev", 1_000, &data(), 1).unwrap();
        let b = ProofOfWork::new(1, "prev", 1_000, &data(), 1).unwrap();
        let timeout = Duration::from_secs(30);
        assert_eq!(a.run(1_000_000, timeout).unwrap(), b.run(1_000_000, timeout).unwrap());
    }

    #[test]
    fn test_max_nonce_bound_yields_mining_timeout() {
        // 64 leading zeros is unreachable
        let pow = ProofOfWork::new(5, "prev", 1_000, &data(), 64).unwrap();
        let err = pow.run(500, Duration::from_secs(30)).unwrap_err();
        match err {
            LedgerError::MiningTimeout {
                index, attempts, ..
            } => {
                assert_eq!(index, 5);
                assert_eq!(attempts, 500);
            }
            other => panic!("expected MiningTimeout, got {other:?}"),
        }
    }

    #[test]
    fn test_wall_clock_bound_yields_mining_timeout() {
        let pow = ProofOfWork::new(5, "prev", 1_000, &data(), 64).unwrap();
        let err = pow.run(u64::MAX, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, LedgerError::MiningTimeout { .. }));
    }
}
