//! Mini-Ledger: a UTXO ledger with proof-of-work and peer gossip
//!
//! This crate provides:
//! - A UTXO set with signed, script-capable transactions
//! - Merkle commitments with inclusion proofs
//! - A stack-based script VM with an assembler
//! - A proof-of-work chain with periodic difficulty adjustment
//! - A TCP gossip node with longest-valid-chain fork resolution
//!
//! # Example
//!
//! ```rust
//! use mini_ledger::core::{Blockchain, COIN};
//! use mini_ledger::crypto::Signer;
//! use mini_ledger::mining::Miner;
//! use mini_ledger::wallet::Wallet;
//!
//! let mut blockchain = Blockchain::with_difficulty(1);
//! let alice = Wallet::new();
//! let bob = Wallet::new();
//!
//! // Mine a block
//! let miner = Miner::new(&alice.address());
//! let (block, stats) = miner.mine_block(&mut blockchain).unwrap();
//! println!("Mined block {} in {}ms", block.index, stats.time_ms);
//!
//! // Pay bob and confirm it
//! alice.send(&mut blockchain, &bob.address(), COIN, 1_000).unwrap();
//! miner.mine_block(&mut blockchain).unwrap();
//! assert_eq!(bob.balance(&blockchain), COIN);
//! ```

pub mod cli;
pub mod contract;
pub mod core;
pub mod crypto;
pub mod mining;
pub mod network;
pub mod wallet;

// Re-export commonly used types
pub use contract::{assemble, disassemble, OpCode, Script, ScriptContext, SmartContract, VM};
pub use core::{
    Amount, Block, Blockchain, ChainConfig, OutPoint, Transaction, UtxoSet, BLOCK_SUBSIDY, COIN,
    DEFAULT_DIFFICULTY,
};
pub use crypto::{KeyPair, MerkleProof, MerkleTree, Signer};
pub use mining::{Mempool, Miner};
pub use network::{Node, NodeConfig};
pub use wallet::Wallet;
