//! Blockchain implementation
//!
//! The chain owns the block list, the UTXO set derived from it, the pending
//! transaction pool and the current difficulty. Every mutation (local
//! mining, remote blocks, wallet submissions) goes through this type, so a
//! single lock around one `Blockchain` value guards all of them.

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::block::{Block, BlockError, GENESIS_PREVIOUS_HASH};
use super::transaction::{
    Amount, Transaction, TransactionError, TransactionInput, TransactionOutput, COIN,
};
use super::utxo::{UtxoSet, UTXO};
use super::validation::validate_transaction;
use crate::crypto::Signer;
use crate::mining::{proof_of_work, Mempool, MiningStats};

/// Default mining difficulty (leading zero hex digits)
pub const DEFAULT_DIFFICULTY: u32 = 4;

/// Subsidy paid to the miner of each block: 6.25 coins
pub const BLOCK_SUBSIDY: Amount = 625_000_000;

/// Number of blocks between difficulty adjustments
pub const DIFFICULTY_ADJUSTMENT_INTERVAL: u64 = 10;

/// Expected wall-clock time for one adjustment window, in seconds
pub const TARGET_TIMESPAN_SECS: i64 = 600;

// =============================================================================
// Configuration
// =============================================================================

/// Consensus parameters. Nodes that share a `ChainConfig` share a genesis
/// block and a difficulty schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub initial_difficulty: u32,
    pub block_subsidy: Amount,
    pub genesis_supply: Amount,
    pub genesis_address: String,
    pub genesis_timestamp: DateTime<Utc>,
    pub adjustment_interval: u64,
    pub target_timespan_secs: i64,
    pub max_difficulty: u32,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            initial_difficulty: DEFAULT_DIFFICULTY,
            block_subsidy: BLOCK_SUBSIDY,
            genesis_supply: 1_000_000 * COIN,
            genesis_address: "genesis".to_string(),
            // 2024-01-01T00:00:00Z
            genesis_timestamp: Utc
                .timestamp_opt(1_704_067_200, 0)
                .single()
                .unwrap_or_default(),
            adjustment_interval: DIFFICULTY_ADJUSTMENT_INTERVAL,
            target_timespan_secs: TARGET_TIMESPAN_SECS,
            max_difficulty: 64,
        }
    }
}

impl ChainConfig {
    /// Default parameters with a different starting difficulty
    pub fn with_difficulty(difficulty: u32) -> Self {
        Self {
            initial_difficulty: difficulty,
            ..Self::default()
        }
    }

    /// Load from a JSON file; missing keys take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, BlockchainError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// The genesis block these parameters describe
    pub fn genesis_block(&self) -> Block {
        Block::genesis(
            &self.genesis_address,
            self.genesis_supply,
            self.genesis_timestamp,
        )
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Blockchain-related errors
#[derive(Error, Debug)]
pub enum BlockchainError {
    #[error("Chain is empty")]
    EmptyChain,
    #[error("Genesis block does not match")]
    GenesisMismatch,
    #[error("Invalid genesis block")]
    InvalidGenesis,
    #[error("Block already in chain: {0}")]
    DuplicateBlock(String),
    #[error("Invalid block index: expected {expected}, found {found}")]
    InvalidIndex { expected: u64, found: u64 },
    #[error("Block {0} does not link to its predecessor")]
    InvalidPreviousHash(u64),
    #[error("Invalid block {index}: {source}")]
    InvalidBlock {
        index: u64,
        #[source]
        source: BlockError,
    },
    #[error("Block {block}, transaction {position}: {source}")]
    InvalidTransaction {
        block: u64,
        position: usize,
        #[source]
        source: TransactionError,
    },
    #[error("Coinbase of block {index} pays {paid}, allowed {allowed}")]
    CoinbaseTooLarge {
        index: u64,
        paid: Amount,
        allowed: Amount,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),
}

/// Chain statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStats {
    pub height: u64,
    pub total_blocks: u64,
    pub total_transactions: u64,
    /// Value held by unspent outputs
    pub circulating_supply: Amount,
    pub utxo_count: usize,
    pub difficulty: u32,
    pub latest_hash: String,
    pub mempool_size: usize,
}

// =============================================================================
// Difficulty schedule
// =============================================================================

/// Difficulty required of the block following `blocks`.
///
/// Only changes when the chain length is a multiple of the adjustment
/// interval. The window runs from the `interval`-th last block to the tip:
/// faster than half the target raises the difficulty by one, slower than
/// twice the target lowers it by one, never below 1.
pub fn next_difficulty(blocks: &[Block], current: u32, config: &ChainConfig) -> u32 {
    let interval = config.adjustment_interval as usize;
    let len = blocks.len();
    if interval == 0 || len < interval || len % interval != 0 {
        return current;
    }

    let first = &blocks[len - interval];
    let last = &blocks[len - 1];
    let elapsed = last
        .timestamp
        .signed_duration_since(first.timestamp)
        .num_seconds();
    let target = config.target_timespan_secs;

    if elapsed < target / 2 {
        current.saturating_add(1).min(config.max_difficulty)
    } else if elapsed > target.saturating_mul(2) {
        current.saturating_sub(1).max(1)
    } else {
        current
    }
}

// =============================================================================
// Blockchain
// =============================================================================

/// The main blockchain structure
#[derive(Debug, Clone)]
pub struct Blockchain {
    blocks: Vec<Block>,
    /// Difficulty the next block must meet
    difficulty: u32,
    utxo_set: UtxoSet,
    mempool: Mempool,
    config: ChainConfig,
}

impl Blockchain {
    /// Create a new blockchain with the default parameters
    pub fn new() -> Self {
        Self::with_config(ChainConfig::default())
    }

    /// Default parameters with a custom starting difficulty
    pub fn with_difficulty(difficulty: u32) -> Self {
        Self::with_config(ChainConfig::with_difficulty(difficulty))
    }

    /// Start a chain holding only the configured genesis block
    pub fn with_config(config: ChainConfig) -> Self {
        let genesis = config.genesis_block();
        let mut utxo_set = UtxoSet::new();
        for tx in &genesis.transactions {
            utxo_set.apply_transaction(tx);
        }

        Self {
            blocks: vec![genesis],
            difficulty: config.initial_difficulty,
            utxo_set,
            mempool: Mempool::new(),
            config,
        }
    }

    /// Rebuild a chain from a full block list, replaying every block
    pub fn from_blocks(blocks: Vec<Block>, config: ChainConfig) -> Result<Self, BlockchainError> {
        let genesis = blocks.first().ok_or(BlockchainError::EmptyChain)?;
        if genesis.hash != config.genesis_block().hash {
            return Err(BlockchainError::GenesisMismatch);
        }

        let (utxo_set, difficulty) = Self::validate_chain(&blocks, &config)?;
        Ok(Self {
            blocks,
            difficulty,
            utxo_set,
            mempool: Mempool::new(),
            config,
        })
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Blocks in chain order, genesis first
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn utxo_set(&self) -> &UtxoSet {
        &self.utxo_set
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    /// The tip. A chain always holds at least its genesis block.
    pub fn latest_block(&self) -> &Block {
        &self.blocks[self.blocks.len() - 1]
    }

    /// Get blockchain height
    pub fn height(&self) -> u64 {
        self.latest_block().index
    }

    /// Get a block by index
    pub fn get_block(&self, index: u64) -> Option<&Block> {
        self.blocks.get(usize::try_from(index).ok()?)
    }

    /// Get a block by hash
    pub fn get_block_by_hash(&self, hash: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.hash == hash)
    }

    pub fn has_block(&self, hash: &str) -> bool {
        self.get_block_by_hash(hash).is_some()
    }

    /// Find a transaction in the chain, then in the mempool
    pub fn get_transaction(&self, tx_id: &str) -> Option<&Transaction> {
        self.blocks
            .iter()
            .flat_map(|b| b.transactions.iter())
            .find(|tx| tx.id == tx_id)
            .or_else(|| self.mempool.get(tx_id))
    }

    pub fn get_balance(&self, address: &str) -> Amount {
        self.utxo_set.balance(address)
    }

    pub fn get_utxos(&self, address: &str) -> Vec<UTXO> {
        self.utxo_set.utxos_for(address)
    }

    /// Get chain statistics
    pub fn stats(&self) -> ChainStats {
        let total_transactions: usize = self.blocks.iter().map(|b| b.tx_count()).sum();

        ChainStats {
            height: self.height(),
            total_blocks: self.blocks.len() as u64,
            total_transactions: total_transactions as u64,
            circulating_supply: self.utxo_set.total_value(),
            utxo_count: self.utxo_set.len(),
            difficulty: self.difficulty,
            latest_hash: self.latest_block().hash.clone(),
            mempool_size: self.mempool.len(),
        }
    }

    // -------------------------------------------------------------------------
    // Transactions
    // -------------------------------------------------------------------------

    /// Validate against the current UTXO set, returning the fee
    pub fn validate_transaction(&self, tx: &Transaction) -> Result<Amount, TransactionError> {
        validate_transaction(tx, &self.utxo_set)
    }

    /// Validate and admit `tx` to the mempool. Nothing changes on failure.
    /// A coinbase is refused: the miner writes its own.
    pub fn add_transaction(&mut self, tx: Transaction) -> Result<String, TransactionError> {
        if tx.is_coinbase() {
            return Err(TransactionError::CoinbaseNotAllowed);
        }
        let fee = self.validate_transaction(&tx)?;
        let id = tx.id.clone();
        self.mempool.add(tx, fee)?;
        debug!("Transaction {} added to mempool (fee {})", id, fee);
        Ok(id)
    }

    /// Build and sign a payment of `amount` to `recipient` from `sender`,
    /// selecting coins largest first and returning change to the sender.
    pub fn create_transaction<S: Signer + ?Sized>(
        &self,
        sender: &S,
        recipient: &str,
        amount: Amount,
        fee: Amount,
    ) -> Result<Transaction, TransactionError> {
        let need = amount
            .checked_add(fee)
            .ok_or(TransactionError::AmountOverflow)?;
        let sender_address = sender.address();
        let (selected, total) = self.utxo_set.find_spendable(&sender_address, need);
        if total < need {
            return Err(TransactionError::InsufficientFunds { have: total, need });
        }

        let inputs = selected
            .iter()
            .map(|u| TransactionInput::new(&u.tx_id, u.output_index))
            .collect();
        let mut outputs = vec![TransactionOutput::new(amount, recipient)];
        let change = total - need;
        if change > 0 {
            outputs.push(TransactionOutput::new(change, &sender_address));
        }

        let mut tx = Transaction::new(inputs, outputs);
        for (index, utxo) in selected.iter().enumerate() {
            tx.sign(index, sender, utxo)?;
        }
        Ok(tx)
    }

    /// Fees of every pending transaction
    pub fn calculate_total_fees(&self) -> Amount {
        self.mempool.total_fees()
    }

    // -------------------------------------------------------------------------
    // Mining
    // -------------------------------------------------------------------------

    /// Mine every pending transaction into a new block paid to `miner_address`
    pub fn mine_block(&mut self, miner_address: &str) -> Result<Block, BlockchainError> {
        self.mine_block_with_stats(miner_address)
            .map(|(block, _)| block)
    }

    pub fn mine_block_with_stats(
        &mut self,
        miner_address: &str,
    ) -> Result<(Block, MiningStats), BlockchainError> {
        let (pending, fees) = self.select_pending();
        let reward = self.config.block_subsidy.saturating_add(fees);

        let mut transactions = Vec::with_capacity(pending.len() + 1);
        transactions.push(Transaction::coinbase(miner_address, reward));
        transactions.extend(pending);

        let mut block = Block::new(
            self.height() + 1,
            self.latest_block().hash.clone(),
            transactions,
        );
        let stats = proof_of_work(&mut block, self.difficulty);

        let utxo_set = self.connect(&block)?;
        self.commit(block.clone(), utxo_set);
        self.mempool.clear();

        Ok((block, stats))
    }

    /// Pending transactions that still apply in order on top of the tip,
    /// with the fees they pay. Stale entries are evicted.
    fn select_pending(&mut self) -> (Vec<Transaction>, Amount) {
        let mut scratch = self.utxo_set.clone();
        let mut selected = Vec::new();
        let mut fees: Amount = 0;
        let mut stale = Vec::new();

        for tx in self.mempool.transactions() {
            if tx.is_coinbase() {
                warn!("Dropping pending coinbase {}", tx.id);
                stale.push(tx.id);
                continue;
            }
            match validate_transaction(&tx, &scratch) {
                Ok(fee) => {
                    scratch.apply_transaction(&tx);
                    fees = fees.saturating_add(fee);
                    selected.push(tx);
                }
                Err(e) => {
                    warn!("Dropping pending transaction {}: {}", tx.id, e);
                    stale.push(tx.id);
                }
            }
        }

        for id in &stale {
            self.mempool.remove(id);
        }
        (selected, fees)
    }

    // -------------------------------------------------------------------------
    // Block acceptance
    // -------------------------------------------------------------------------

    /// Validate a block received from elsewhere against the tip and append it
    pub fn accept_block(&mut self, block: Block) -> Result<(), BlockchainError> {
        if self.has_block(&block.hash) {
            return Err(BlockchainError::DuplicateBlock(block.hash));
        }

        let utxo_set = self.connect(&block)?;
        let evicted = self.mempool.remove_confirmed(&block.transactions);
        if evicted > 0 {
            debug!("{} mempool transactions confirmed or conflicted", evicted);
        }
        self.commit(block, utxo_set);
        Ok(())
    }

    /// Check `block` as the next block and return the UTXO set after it
    fn connect(&self, block: &Block) -> Result<UtxoSet, BlockchainError> {
        let mut scratch = self.utxo_set.clone();
        check_block(
            block,
            self.latest_block(),
            self.difficulty,
            self.config.block_subsidy,
            &mut scratch,
        )?;
        Ok(scratch)
    }

    fn commit(&mut self, block: Block, utxo_set: UtxoSet) {
        info!(
            "Block {} appended: {} ({} transactions)",
            block.index,
            block.hash,
            block.tx_count()
        );
        self.blocks.push(block);
        self.utxo_set = utxo_set;
        self.adjust_difficulty();
    }

    fn adjust_difficulty(&mut self) {
        let next = next_difficulty(&self.blocks, self.difficulty, &self.config);
        if next != self.difficulty {
            info!(
                "Difficulty adjusted from {} to {} at height {}",
                self.difficulty,
                next,
                self.height()
            );
            self.difficulty = next;
        }
    }

    // -------------------------------------------------------------------------
    // Chain validation
    // -------------------------------------------------------------------------

    /// Replay the whole chain from genesis against a fresh UTXO set
    pub fn is_chain_valid(&self) -> bool {
        match Self::validate_chain(&self.blocks, &self.config) {
            Ok(_) => true,
            Err(e) => {
                warn!("Chain validation failed: {}", e);
                false
            }
        }
    }

    /// Replay `blocks` from genesis, returning the resulting UTXO set and
    /// the difficulty required of the next block.
    pub fn validate_chain(
        blocks: &[Block],
        config: &ChainConfig,
    ) -> Result<(UtxoSet, u32), BlockchainError> {
        let genesis = blocks.first().ok_or(BlockchainError::EmptyChain)?;
        if genesis.index != 0 || genesis.previous_hash != GENESIS_PREVIOUS_HASH {
            return Err(BlockchainError::InvalidGenesis);
        }
        genesis
            .validate_structure(0)
            .map_err(|source| BlockchainError::InvalidBlock { index: 0, source })?;

        let mut utxo_set = UtxoSet::new();
        for (position, tx) in genesis.transactions.iter().enumerate() {
            validate_transaction(tx, &utxo_set).map_err(|source| {
                BlockchainError::InvalidTransaction {
                    block: 0,
                    position,
                    source,
                }
            })?;
            utxo_set.apply_transaction(tx);
        }

        let mut difficulty = config.initial_difficulty;
        for i in 1..blocks.len() {
            check_block(
                &blocks[i],
                &blocks[i - 1],
                difficulty,
                config.block_subsidy,
                &mut utxo_set,
            )?;
            difficulty = next_difficulty(&blocks[..=i], difficulty, config);
        }

        Ok((utxo_set, difficulty))
    }

    /// Adopt `blocks` if strictly longer, rooted at the same genesis and
    /// valid end to end. Pending transactions that still apply stay pending.
    pub fn replace_chain(&mut self, blocks: Vec<Block>) -> bool {
        if blocks.len() <= self.blocks.len() {
            debug!(
                "Ignoring chain of {} blocks (local has {})",
                blocks.len(),
                self.blocks.len()
            );
            return false;
        }
        if blocks.first().map(|b| &b.hash) != Some(&self.blocks[0].hash) {
            warn!("Ignoring chain with a different genesis block");
            return false;
        }

        let (utxo_set, difficulty) = match Self::validate_chain(&blocks, &self.config) {
            Ok(state) => state,
            Err(e) => {
                warn!("Ignoring invalid chain: {}", e);
                return false;
            }
        };

        info!(
            "Replacing chain: height {} -> {}",
            self.height(),
            blocks.len() - 1
        );
        let pending = self.mempool.drain();
        self.blocks = blocks;
        self.utxo_set = utxo_set;
        self.difficulty = difficulty;

        for tx in pending {
            if let Err(e) = self.add_transaction(tx) {
                debug!("Pending transaction dropped after reorg: {}", e);
            }
        }
        true
    }
}

impl Default for Blockchain {
    fn default() -> Self {
        Self::new()
    }
}

/// Full consensus check of `block` on top of `prev`, applying its
/// transactions to `utxo_set` as it goes.
fn check_block(
    block: &Block,
    prev: &Block,
    difficulty: u32,
    subsidy: Amount,
    utxo_set: &mut UtxoSet,
) -> Result<(), BlockchainError> {
    let index = block.index;
    if index != prev.index + 1 {
        return Err(BlockchainError::InvalidIndex {
            expected: prev.index + 1,
            found: index,
        });
    }
    if block.previous_hash != prev.hash {
        return Err(BlockchainError::InvalidPreviousHash(index));
    }
    block
        .validate_structure(difficulty)
        .map_err(|source| BlockchainError::InvalidBlock { index, source })?;

    let mut fees: Amount = 0;
    for (position, tx) in block.transactions.iter().enumerate() {
        let fee = validate_transaction(tx, utxo_set).map_err(|source| {
            BlockchainError::InvalidTransaction {
                block: index,
                position,
                source,
            }
        })?;
        utxo_set.apply_transaction(tx);
        fees = fees.saturating_add(fee);
    }

    // validate_structure guarantees a leading coinbase
    let paid = block
        .coinbase_tx()
        .and_then(Transaction::total_output)
        .unwrap_or(0);
    let allowed = subsidy.saturating_add(fees);
    if paid > allowed {
        return Err(BlockchainError::CoinbaseTooLarge {
            index,
            paid,
            allowed,
        });
    }
    Ok(())
}
