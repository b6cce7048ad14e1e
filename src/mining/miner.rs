//! Proof-of-work search
//!
//! The nonce loop is unbounded and CPU-bound. Callers that need to stay
//! responsive run it on a blocking worker.

use std::time::Instant;

use log::info;

use crate::core::{Block, Blockchain, BlockchainError};

/// Mining statistics
#[derive(Debug, Clone)]
pub struct MiningStats {
    /// Number of hash attempts
    pub hash_attempts: u64,
    /// Time taken in milliseconds
    pub time_ms: u128,
    /// Hash rate (hashes per second)
    pub hash_rate: f64,
}

/// Seal `block` at `difficulty`, timing the search
pub fn proof_of_work(block: &mut Block, difficulty: u32) -> MiningStats {
    info!(
        "Mining block {} with difficulty {}...",
        block.index, difficulty
    );

    let start = Instant::now();
    let attempts = block.mine(difficulty);
    let elapsed = start.elapsed().as_millis();

    let hash_rate = if elapsed > 0 {
        (attempts as f64) / (elapsed as f64 / 1000.0)
    } else {
        attempts as f64
    };

    info!(
        "Block {} mined in {}ms ({} attempts, {:.2} H/s)",
        block.index, elapsed, attempts, hash_rate
    );

    MiningStats {
        hash_attempts: attempts,
        time_ms: elapsed,
        hash_rate,
    }
}

/// Miner for creating new blocks
pub struct Miner {
    /// Miner's address for receiving rewards
    pub address: String,
}

impl Miner {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
        }
    }

    /// Mine every pending transaction into a new block
    pub fn mine_block(
        &self,
        blockchain: &mut Blockchain,
    ) -> Result<(Block, MiningStats), BlockchainError> {
        blockchain.mine_block_with_stats(&self.address)
    }

    /// Mine `num_blocks` blocks back to back
    pub fn mine_continuously(
        &self,
        blockchain: &mut Blockchain,
        num_blocks: u64,
    ) -> Result<Vec<(Block, MiningStats)>, BlockchainError> {
        (0..num_blocks).map(|_| self.mine_block(blockchain)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proof_of_work_meets_target() {
        let mut block = Block::new(1, "ab".repeat(32), vec![]);
        let stats = proof_of_work(&mut block, 2);
        assert!(block.hash.starts_with("00"));
        assert!(block.verify_hash());
        assert!(stats.hash_attempts >= 1);
    }

    #[test]
    fn test_miner() {
        let mut blockchain = Blockchain::with_difficulty(1);
        let miner = Miner::new("miner_address");

        let (block, stats) = miner.mine_block(&mut blockchain).unwrap();

        assert_eq!(block.index, 1);
        assert!(block.meets_difficulty(1));
        assert!(stats.hash_attempts > 0);
    }

    #[test]
    fn test_mine_multiple_blocks() {
        let mut blockchain = Blockchain::with_difficulty(1);
        let miner = Miner::new("miner_address");

        let results = miner.mine_continuously(&mut blockchain, 3).unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(blockchain.height(), 3);
    }
}
