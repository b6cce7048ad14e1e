//! Block implementation for the ledger
//!
//! A block commits to its transactions through a merkle root over their
//! ids and is sealed by a nonce that gives its hash the required number of
//! leading zero hex digits.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::transaction::{Amount, Transaction};
use crate::crypto::{
    calculate_merkle_root, double_sha256_hex, meets_difficulty, MerkleError, MerkleProof,
    MerkleTree,
};

/// `previous_hash` of the genesis block
pub const GENESIS_PREVIOUS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

// =============================================================================
// Block Errors
// =============================================================================

/// Block validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("Block has no transactions")]
    Empty,
    #[error("Invalid block hash")]
    InvalidBlockHash,
    #[error("Invalid merkle root")]
    InvalidMerkleRoot,
    #[error("Invalid proof of work: hash does not have {0} leading zeros")]
    InvalidProofOfWork(u32),
    #[error("First transaction is not a coinbase")]
    MissingCoinbase,
    #[error("Coinbase found at position {0}")]
    MisplacedCoinbase(usize),
}

/// A block in the chain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub index: u64,
    pub transactions: Vec<Transaction>,
    pub timestamp: DateTime<Utc>,
    pub previous_hash: String,
    pub nonce: u64,
    pub merkle_root: String,
    /// Stored hash; recomputed and compared on validation
    pub hash: String,
}

impl Block {
    /// Create a new, unsealed block stamped with the current time
    pub fn new(index: u64, previous_hash: String, transactions: Vec<Transaction>) -> Self {
        Self::with_timestamp(index, previous_hash, transactions, Utc::now())
    }

    pub fn with_timestamp(
        index: u64,
        previous_hash: String,
        transactions: Vec<Transaction>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let merkle_root = Self::calculate_merkle_root(&transactions);
        let mut block = Self {
            index,
            transactions,
            timestamp,
            previous_hash,
            nonce: 0,
            merkle_root,
            hash: String::new(),
        };
        block.hash = block.compute_hash();
        block
    }

    /// The genesis block: one coinbase minting `supply` to `address`.
    /// Fully determined by its arguments so every node derives the same one.
    pub fn genesis(address: &str, supply: Amount, timestamp: DateTime<Utc>) -> Self {
        let coinbase = Transaction::coinbase_at(address, supply, timestamp);
        Self::with_timestamp(0, GENESIS_PREVIOUS_HASH.to_string(), vec![coinbase], timestamp)
    }

    /// Hash over index, merkle root, timestamp, previous hash and nonce
    pub fn compute_hash(&self) -> String {
        let data = format!(
            "{}:{}:{}:{}:{}",
            self.index,
            self.merkle_root,
            self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
            self.previous_hash,
            self.nonce
        );
        double_sha256_hex(data.as_bytes())
    }

    fn leaf(tx: &Transaction) -> Vec<u8> {
        hex::decode(&tx.id).unwrap_or_else(|_| tx.id.as_bytes().to_vec())
    }

    /// Calculate the merkle root from transaction ids
    pub fn calculate_merkle_root(transactions: &[Transaction]) -> String {
        let leaves: Vec<Vec<u8>> = transactions.iter().map(Self::leaf).collect();
        hex::encode(calculate_merkle_root(&leaves))
    }

    /// Merkle tree over this block's transaction ids
    pub fn merkle_tree(&self) -> Result<MerkleTree, MerkleError> {
        let leaves: Vec<Vec<u8>> = self.transactions.iter().map(Self::leaf).collect();
        MerkleTree::build(&leaves)
    }

    /// Search nonces until the hash meets `difficulty`; returns attempts
    pub fn mine(&mut self, difficulty: u32) -> u64 {
        let mut attempts = 0u64;
        self.nonce = 0;
        loop {
            self.hash = self.compute_hash();
            attempts += 1;
            if meets_difficulty(&self.hash, difficulty) {
                return attempts;
            }
            self.nonce = self.nonce.wrapping_add(1);
        }
    }

    pub fn meets_difficulty(&self, difficulty: u32) -> bool {
        meets_difficulty(&self.hash, difficulty)
    }

    /// Verify the stored hash against the block contents
    pub fn verify_hash(&self) -> bool {
        self.hash == self.compute_hash()
    }

    /// Verify the block's merkle root
    pub fn verify_merkle_root(&self) -> bool {
        Self::calculate_merkle_root(&self.transactions) == self.merkle_root
    }

    /// Inclusion proof for the transaction with id `tx_id`
    pub fn inclusion_proof(&self, tx_id: &str) -> Option<MerkleProof> {
        let index = self.transactions.iter().position(|tx| tx.id == tx_id)?;
        self.merkle_tree().ok()?.proof(index).ok()
    }

    /// Prove that `tx` is committed to by this block's merkle root.
    /// Returns the proof when it checks out.
    pub fn verify_transaction_inclusion(&self, tx: &Transaction) -> Option<MerkleProof> {
        let proof = self.inclusion_proof(&tx.id)?;
        let root = hex::decode(&self.merkle_root).ok()?;
        proof.verify(&Self::leaf(tx), &root).then_some(proof)
    }

    /// Get the coinbase transaction (first transaction)
    pub fn coinbase_tx(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }

    /// Hash, merkle root, proof of work and coinbase placement
    pub fn validate_structure(&self, difficulty: u32) -> Result<(), BlockError> {
        if self.transactions.is_empty() {
            return Err(BlockError::Empty);
        }
        if !self.verify_hash() {
            return Err(BlockError::InvalidBlockHash);
        }
        if !self.verify_merkle_root() {
            return Err(BlockError::InvalidMerkleRoot);
        }
        if !self.meets_difficulty(difficulty) {
            return Err(BlockError::InvalidProofOfWork(difficulty));
        }
        if self.coinbase_tx().is_none() {
            return Err(BlockError::MissingCoinbase);
        }
        if let Some(position) = self
            .transactions
            .iter()
            .skip(1)
            .position(|tx| tx.is_coinbase())
        {
            return Err(BlockError::MisplacedCoinbase(position + 1));
        }
        Ok(())
    }

    pub fn tx_count(&self) -> usize {
        self.transactions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::{TransactionInput, TransactionOutput, COIN};

    fn sealed(difficulty: u32) -> Block {
        let txs = vec![
            Transaction::coinbase("miner", 50 * COIN),
            Transaction::new(
                vec![TransactionInput::new(&"cd".repeat(32), 0)],
                vec![TransactionOutput::new(COIN, "other")],
            ),
        ];
        let mut block = Block::new(1, "ab".repeat(32), txs);
        block.mine(difficulty);
        block
    }

    #[test]
    fn test_genesis_block_is_deterministic() {
        let ts = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let a = Block::genesis("genesis", 1_000 * COIN, ts);
        let b = Block::genesis("genesis", 1_000 * COIN, ts);
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.index, 0);
        assert_eq!(a.previous_hash, GENESIS_PREVIOUS_HASH);
        assert!(a.coinbase_tx().is_some());
    }

    #[test]
    fn test_block_mining() {
        let block = sealed(2);
        assert!(block.hash.starts_with("00"));
        assert!(block.verify_hash());
        assert!(block.verify_merkle_root());
    }

    #[test]
    fn test_serde_roundtrip_keeps_hash() {
        let block = sealed(1);
        let json = serde_json::to_string(&block).unwrap();
        let back: Block = serde_json::from_str(&json).unwrap();
        assert_eq!(back.hash, block.hash);
        assert_eq!(back.compute_hash(), block.hash);
        assert_eq!(back, block);
    }

    #[test]
    fn test_merkle_root_verification() {
        let mut block = sealed(1);
        block.transactions[0].id = "tampered_id".to_string();
        assert!(!block.verify_merkle_root());
    }

    #[test]
    fn test_block_hash_verification() {
        let mut block = sealed(1);
        block.nonce += 1;
        assert!(!block.verify_hash());
    }

    #[test]
    fn test_inclusion_proof() {
        let block = sealed(1);
        let tx = block.transactions[1].clone();
        assert!(block.verify_transaction_inclusion(&tx).is_some());

        let outsider = Transaction::coinbase("nobody", 1);
        assert!(block.verify_transaction_inclusion(&outsider).is_none());
    }

    #[test]
    fn test_validate_structure() {
        let block = sealed(1);
        assert_eq!(block.validate_structure(1), Ok(()));

        let mut misplaced = Block::new(
            1,
            "ab".repeat(32),
            vec![
                Transaction::coinbase("a", 1),
                Transaction::coinbase("b", 1),
            ],
        );
        misplaced.mine(0);
        assert_eq!(
            misplaced.validate_structure(0),
            Err(BlockError::MisplacedCoinbase(1))
        );
    }
}
