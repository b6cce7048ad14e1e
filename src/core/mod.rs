//! Core ledger components
//!
//! This module contains the fundamental building blocks:
//! - UTXO set (outpoints, unspent outputs, per-address index)
//! - Transactions (signed inputs, optional attached contracts)
//! - Validation (the rule set shared by admission and replay)
//! - Blocks (merkle commitment and proof of work)
//! - Blockchain (chain, mempool, difficulty schedule, fork replacement)

pub mod block;
pub mod blockchain;
pub mod transaction;
pub mod utxo;
pub mod validation;

pub use block::{Block, BlockError, GENESIS_PREVIOUS_HASH};
pub use blockchain::{
    next_difficulty, Blockchain, BlockchainError, ChainConfig, ChainStats, BLOCK_SUBSIDY,
    DEFAULT_DIFFICULTY, DIFFICULTY_ADJUSTMENT_INTERVAL, TARGET_TIMESPAN_SECS,
};
pub use transaction::{
    Amount, Transaction, TransactionError, TransactionInput, TransactionOutput,
    CONTRACT_ADDRESS_PREFIX, COIN,
};
pub use utxo::{OutPoint, UtxoSet, UTXO};
pub use validation::{transaction_fee, validate_transaction};
